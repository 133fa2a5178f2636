// THEORY:
// The transfer channel joins the two compute domains. It is a strict
// half-duplex ping-pong, not a queue of work: the host hands a plane over,
// the accelerator hands the same plane back, and only then may the buffer be
// reused. Index updates are one-way and never touch the buffer.
//
// Each side gets its own endpoint. The host endpoint is async because the
// host awaits the acknowledgement while the tracker's runtime stays free; the
// accelerator endpoint blocks, because the worker owns a thread of its own
// and has nothing else to do between dispatches. Payloads travel as raw
// 32-bit words so the wire format in `notification` is the single source of
// truth for both directions.

use crate::core_modules::notification::{Notification, Reply};
use crate::core_modules::shared_buffer::SharedBuffer;
use crate::error::{TrackingError, TrackingResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Creates the two endpoints of a channel sharing `buffer`.
pub fn link(buffer: Arc<SharedBuffer>) -> (HostEndpoint, AcceleratorEndpoint) {
    let (to_accelerator, from_host) = mpsc::unbounded_channel::<u32>();
    let (to_host, from_accelerator) = mpsc::unbounded_channel::<u32>();
    (
        HostEndpoint {
            to_accelerator,
            from_accelerator,
            buffer: Arc::clone(&buffer),
            awaiting_plane: None,
        },
        AcceleratorEndpoint {
            from_host,
            to_host,
            buffer,
        },
    )
}

/// The host side of the channel.
pub struct HostEndpoint {
    to_accelerator: mpsc::UnboundedSender<u32>,
    from_accelerator: mpsc::UnboundedReceiver<u32>,
    buffer: Arc<SharedBuffer>,
    /// The plane whose acknowledgement has not arrived yet.
    awaiting_plane: Option<u8>,
}

impl HostEndpoint {
    /// Sends a notification. A `PlaneReady` opens an exchange that must be
    /// closed by `wait_receive` before anything else is sent.
    pub fn send(&mut self, notification: Notification) -> TrackingResult<()> {
        if let Some(plane) = self.awaiting_plane {
            return Err(TrackingError::protocol(format!(
                "cannot send {notification:?} while plane {plane} is in flight"
            )));
        }
        self.to_accelerator
            .send(notification.encode())
            .map_err(|_| TrackingError::ChannelClosed)?;
        if let Notification::PlaneReady(plane) = notification {
            self.awaiting_plane = Some(plane);
        }
        Ok(())
    }

    /// Sends the termination word regardless of any exchange in flight.
    /// Termination is the accelerator's only cancellation path.
    pub fn terminate(&mut self) -> TrackingResult<()> {
        self.awaiting_plane = None;
        self.to_accelerator
            .send(Notification::Terminate.encode())
            .map_err(|_| TrackingError::ChannelClosed)
    }

    /// Waits for the accelerator's next reply. An acknowledgement must name
    /// the plane currently in flight.
    pub async fn wait_receive(&mut self) -> TrackingResult<Reply> {
        let raw = self
            .from_accelerator
            .recv()
            .await
            .ok_or(TrackingError::ChannelClosed)?;
        let reply = Reply::decode(raw)?;
        match (reply, self.awaiting_plane.take()) {
            (Reply::PlaneDone(done), Some(sent)) if done == sent => Ok(reply),
            (Reply::PlaneDone(done), sent) => Err(TrackingError::protocol(format!(
                "acknowledgement for plane {done} while {sent:?} was in flight"
            ))),
            (Reply::Ready, Some(sent)) => Err(TrackingError::protocol(format!(
                "readiness signal while plane {sent} was in flight"
            ))),
            (Reply::Ready, None) => Ok(reply),
        }
    }

    /// Blocks session setup until the accelerator reports it is ready.
    pub async fn wait_ready(&mut self) -> TrackingResult<()> {
        match self.wait_receive().await? {
            Reply::Ready => {
                debug!("accelerator reported ready");
                Ok(())
            }
            other => Err(TrackingError::protocol(format!(
                "expected readiness signal, got {other:?}"
            ))),
        }
    }

    /// Marks `byte_count` bytes of the sample view valid and flushes them.
    pub fn write_buffer(&self, byte_count: usize) -> TrackingResult<()> {
        self.buffer.flush(byte_count)
    }

    pub fn raw_buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn exchange_in_flight(&self) -> bool {
        self.awaiting_plane.is_some()
    }
}

/// The accelerator side of the channel.
pub struct AcceleratorEndpoint {
    from_host: mpsc::UnboundedReceiver<u32>,
    to_host: mpsc::UnboundedSender<u32>,
    buffer: Arc<SharedBuffer>,
}

impl AcceleratorEndpoint {
    pub fn signal_ready(&self) -> TrackingResult<()> {
        self.reply(Reply::Ready)
    }

    pub fn reply(&self, reply: Reply) -> TrackingResult<()> {
        self.to_host
            .send(reply.encode())
            .map_err(|_| TrackingError::ChannelClosed)
    }

    /// Blocks until the host sends a notification. A closed channel is seen
    /// as a termination request. Words that do not decode are skipped.
    pub fn wait_receive(&mut self) -> Notification {
        loop {
            let Some(raw) = self.from_host.blocking_recv() else {
                debug!("host endpoint dropped, terminating");
                return Notification::Terminate;
            };
            match Notification::decode(raw) {
                Ok(notification) => return notification,
                Err(e) => warn!("ignoring notification {raw:#010x}: {e}"),
            }
        }
    }

    pub fn write_buffer(&self, byte_count: usize) -> TrackingResult<()> {
        self.buffer.flush(byte_count)
    }

    pub fn raw_buffer(&self) -> &SharedBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::histogram::BinTriple;

    fn linked() -> (HostEndpoint, AcceleratorEndpoint) {
        link(Arc::new(SharedBuffer::allocate(64).unwrap()))
    }

    #[tokio::test]
    async fn second_plane_cannot_overlap_the_first() {
        let (mut host, _accelerator) = linked();
        host.send(Notification::PlaneReady(0)).unwrap();
        assert!(host.exchange_in_flight());
        let err = host.send(Notification::PlaneReady(1)).unwrap_err();
        assert!(matches!(err, TrackingError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn acknowledgement_closes_the_exchange() {
        let (mut host, accelerator) = linked();
        host.send(Notification::PlaneReady(2)).unwrap();
        accelerator.reply(Reply::PlaneDone(2)).unwrap();
        assert_eq!(host.wait_receive().await.unwrap(), Reply::PlaneDone(2));
        assert!(!host.exchange_in_flight());
        host.send(Notification::PlaneReady(0)).unwrap();
    }

    #[test]
    fn terminate_overrides_an_open_exchange() {
        let (mut host, mut accelerator) = linked();
        host.send(Notification::PlaneReady(0)).unwrap();
        host.terminate().unwrap();
        assert!(!host.exchange_in_flight());
        assert_eq!(accelerator.wait_receive(), Notification::PlaneReady(0));
        assert_eq!(accelerator.wait_receive(), Notification::Terminate);
    }

    #[tokio::test]
    async fn mismatched_acknowledgement_is_a_violation() {
        let (mut host, accelerator) = linked();
        host.send(Notification::PlaneReady(1)).unwrap();
        accelerator.reply(Reply::PlaneDone(0)).unwrap();
        assert!(matches!(
            host.wait_receive().await,
            Err(TrackingError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn dropped_accelerator_closes_the_channel() {
        let (mut host, accelerator) = linked();
        drop(accelerator);
        assert!(matches!(
            host.wait_receive().await,
            Err(TrackingError::ChannelClosed)
        ));
    }

    #[test]
    fn out_of_range_index_update_is_skipped() {
        let (host, mut accelerator) = linked();
        host.to_accelerator.send(0x1000_0011).unwrap();
        host.to_accelerator.send(Notification::PlaneReady(2).encode()).unwrap();
        assert_eq!(accelerator.wait_receive(), Notification::PlaneReady(2));
    }

    #[test]
    fn accelerator_sees_host_words_in_order() {
        let (mut host, mut accelerator) = linked();
        let bins = BinTriple::new([3, 4, 5]).unwrap();
        host.send(Notification::ModelIndexUpdate(bins)).unwrap();
        host.send(Notification::PlaneReady(1)).unwrap();
        drop(host);

        assert_eq!(accelerator.wait_receive(), Notification::ModelIndexUpdate(bins));
        assert_eq!(accelerator.wait_receive(), Notification::PlaneReady(1));
        assert_eq!(accelerator.wait_receive(), Notification::Terminate);
    }
}
