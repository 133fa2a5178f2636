// THEORY:
// The `accelerator` module is the second compute domain. The worker owns its
// own copies of the target model and the candidate, and it keeps them in sync
// with the host purely from the three bin indices carried by index-update
// notifications: because the host samples a single pixel, those indices are
// the whole histogram. When the host hands a plane over, the worker turns
// every sample into a `model / candidate` ratio with the same numeric backend
// the host uses and writes the floats back into the same cells.
//
// The worker is an actor with one suspension point, the blocking receive. It
// loops until it observes a termination word or an impossible plane id, then
// drops its endpoint, which the host observes as a closed channel.
//
// The session owns the worker's lifecycle. It allocates the shared buffer
// from a size string, starts the worker, waits for its readiness signal, and
// later tells it to stop.

use crate::core_modules::histogram::{BIN_COUNT, HistogramModel, PLANES, quantize_sample};
use crate::core_modules::notification::{Notification, Reply};
use crate::core_modules::numeric::Numeric;
use crate::core_modules::shared_buffer::{BufferView, SharedBuffer};
use crate::core_modules::transfer::{self, AcceleratorEndpoint, HostEndpoint};
use crate::error::{TrackingError, TrackingResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters reported by the worker when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub model_updates: u64,
    pub candidate_updates: u64,
    pub planes_processed: u64,
}

/// What the dispatch loop should do after handling a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Stop,
}

/// The accelerator-side state machine.
pub struct AcceleratorWorker<N: Numeric> {
    endpoint: AcceleratorEndpoint,
    model: HistogramModel<N>,
    candidate: HistogramModel<N>,
    samples: Vec<u32>,
    ratios: Vec<f32>,
    stats: WorkerStats,
}

impl<N: Numeric> AcceleratorWorker<N> {
    pub fn new(endpoint: AcceleratorEndpoint) -> Self {
        Self {
            endpoint,
            model: HistogramModel::seeded(),
            candidate: HistogramModel::seeded(),
            samples: Vec::new(),
            ratios: Vec::new(),
            stats: WorkerStats::default(),
        }
    }

    pub fn model(&self) -> &HistogramModel<N> {
        &self.model
    }

    pub fn candidate(&self) -> &HistogramModel<N> {
        &self.candidate
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Signals readiness, then serves notifications until told to stop.
    pub fn run(mut self) -> TrackingResult<WorkerStats> {
        self.endpoint.signal_ready()?;
        loop {
            let notification = self.endpoint.wait_receive();
            if self.dispatch(notification)? == Dispatch::Stop {
                break;
            }
        }
        debug!(stats = ?self.stats, "accelerator worker exiting");
        Ok(self.stats)
    }

    pub fn dispatch(&mut self, notification: Notification) -> TrackingResult<Dispatch> {
        match notification {
            Notification::ModelIndexUpdate(bins) => {
                self.model = HistogramModel::from_bins(bins);
                self.stats.model_updates += 1;
                Ok(Dispatch::Continue)
            }
            Notification::CandidateIndexUpdate(bins) => {
                self.candidate = HistogramModel::from_bins(bins);
                self.stats.candidate_updates += 1;
                Ok(Dispatch::Continue)
            }
            Notification::PlaneReady(plane) if (plane as usize) < PLANES => {
                self.process_plane(plane)?;
                self.endpoint.reply(Reply::PlaneDone(plane))?;
                self.stats.planes_processed += 1;
                Ok(Dispatch::Continue)
            }
            Notification::PlaneReady(plane) => {
                warn!(plane, "plane id out of range, treating as termination");
                Ok(Dispatch::Stop)
            }
            Notification::Terminate => Ok(Dispatch::Stop),
        }
    }

    fn process_plane(&mut self, plane: u8) -> TrackingResult<()> {
        let table: [f32; BIN_COUNT] = self.model.ratio_table(&self.candidate, plane as usize)?;
        let buffer = self.endpoint.raw_buffer();

        let valid_bytes = buffer.invalidate();
        let count = valid_bytes / SharedBuffer::ELEMENT_BYTES;
        self.samples.resize(count, 0);
        buffer.read_samples(0, &mut self.samples)?;

        self.ratios.clear();
        self.ratios
            .extend(self.samples.iter().map(|&sample| table[quantize_sample(sample)]));

        buffer.switch_view(BufferView::Ratios);
        buffer.write_ratios(0, &self.ratios)?;
        self.endpoint.write_buffer(valid_bytes)
    }
}

/// A running accelerator: the host endpoint plus the worker's task.
pub struct AcceleratorSession {
    host: HostEndpoint,
    worker: Option<JoinHandle<TrackingResult<WorkerStats>>>,
    executable: String,
}

impl AcceleratorSession {
    /// Allocates the shared buffer, starts the worker, and waits for its
    /// readiness signal. `executable` identifies the accelerator image and is
    /// only recorded.
    pub async fn start<N: Numeric>(executable: &str, buffer_size: &str) -> TrackingResult<Self> {
        let buffer = Arc::new(SharedBuffer::from_size_str(buffer_size)?);
        let capacity = buffer.capacity_bytes();
        let (mut host, endpoint) = transfer::link(buffer);

        let worker = tokio::task::spawn_blocking(move || AcceleratorWorker::<N>::new(endpoint).run());
        host.wait_ready().await?;

        info!(executable, capacity, backend = N::NAME, "accelerator session started");
        Ok(Self {
            host,
            worker: Some(worker),
            executable: executable.to_string(),
        })
    }

    pub fn host(&mut self) -> &mut HostEndpoint {
        &mut self.host
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Sends the termination word and joins the worker.
    pub async fn stop(mut self, processor_id: u8) -> TrackingResult<WorkerStats> {
        let Some(worker) = self.worker.take() else {
            return Err(TrackingError::ChannelClosed);
        };
        if let Err(e) = self.host.terminate() {
            warn!(processor_id, "could not deliver termination: {e}");
        }
        let stats = worker.await??;
        info!(processor_id, executable = %self.executable, ?stats, "accelerator session stopped");
        Ok(stats)
    }
}

impl Drop for AcceleratorSession {
    fn drop(&mut self) {
        // Best effort shutdown on drop
        if self.worker.is_some() {
            let _ = self.host.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::histogram::BinTriple;
    use crate::core_modules::numeric::Q16;

    fn linked_worker<N: Numeric>() -> (HostEndpoint, AcceleratorWorker<N>) {
        let buffer = Arc::new(SharedBuffer::allocate(256).unwrap());
        let (host, endpoint) = transfer::link(buffer);
        (host, AcceleratorWorker::new(endpoint))
    }

    #[test]
    fn index_updates_rebuild_the_local_histograms() {
        let (_host, mut worker) = linked_worker::<Q16>();
        let first = BinTriple::new([1, 2, 3]).unwrap();
        let second = BinTriple::new([4, 5, 6]).unwrap();

        worker.dispatch(Notification::ModelIndexUpdate(first)).unwrap();
        worker.dispatch(Notification::CandidateIndexUpdate(first)).unwrap();
        worker.dispatch(Notification::CandidateIndexUpdate(second)).unwrap();

        assert_eq!(worker.model(), &HistogramModel::from_bins(first));
        assert_eq!(worker.candidate(), &HistogramModel::from_bins(second));
        assert_eq!(worker.stats().model_updates, 1);
        assert_eq!(worker.stats().candidate_updates, 2);
    }

    #[tokio::test]
    async fn plane_is_answered_with_ratios_and_acknowledged() {
        let (mut host, mut worker) = linked_worker::<f32>();
        let bins = BinTriple::new([0, 0, 0]).unwrap();
        worker.dispatch(Notification::ModelIndexUpdate(bins)).unwrap();
        worker
            .dispatch(Notification::CandidateIndexUpdate(BinTriple::new([1, 1, 1]).unwrap()))
            .unwrap();

        // Bin 0 is the model's colour, bin 1 the candidate's.
        host.raw_buffer().write_samples(0, &[5, 20, 200]).unwrap();
        host.write_buffer(12).unwrap();
        host.send(Notification::PlaneReady(0)).unwrap();

        let notification = Notification::decode(Notification::PlaneReady(0).encode()).unwrap();
        assert_eq!(worker.dispatch(notification).unwrap(), Dispatch::Continue);
        assert_eq!(host.wait_receive().await.unwrap(), Reply::PlaneDone(0));

        let buffer = host.raw_buffer();
        assert_eq!(buffer.view(), BufferView::Ratios);
        assert_eq!(buffer.invalidate(), 12);
        let mut ratios = [0.0f32; 3];
        buffer.read_ratios(0, &mut ratios).unwrap();
        assert_eq!(ratios[0], 1.0 / 1e-10);
        assert_eq!(ratios[1], 1e-10 / 1.0);
        assert_eq!(ratios[2], 1.0);
    }

    #[test]
    fn invalid_plane_and_terminate_stop_the_loop() {
        let (_host, mut worker) = linked_worker::<f32>();
        assert_eq!(worker.dispatch(Notification::PlaneReady(3)).unwrap(), Dispatch::Stop);
        assert_eq!(worker.dispatch(Notification::Terminate).unwrap(), Dispatch::Stop);
        assert_eq!(worker.stats().planes_processed, 0);
    }

    #[tokio::test]
    async fn session_starts_and_stops_cleanly() {
        let mut session = AcceleratorSession::start::<Q16>("pool_notify.out", "65536")
            .await
            .unwrap();
        assert_eq!(session.executable(), "pool_notify.out");
        assert_eq!(session.host().raw_buffer().capacity_bytes(), 65536);

        let bins = BinTriple::new([7, 7, 7]).unwrap();
        session.host().send(Notification::ModelIndexUpdate(bins)).unwrap();

        let stats = session.stop(0).await.unwrap();
        assert_eq!(stats.model_updates, 1);
        assert_eq!(stats.planes_processed, 0);
    }

    #[tokio::test]
    async fn session_rejects_bad_buffer_size() {
        let result = AcceleratorSession::start::<f32>("pool_notify.out", "not-a-size").await;
        assert!(matches!(result, Err(TrackingError::InvalidBufferSize(_))));
    }
}
