// Runs the tracker over a synthetic sequence: a red square drifting across a
// teal background. Configuration comes from `MS_*` environment variables, and
// `MS_BACKEND=q16` selects the fixed-point histograms.

use anyhow::Context;
use image::{Rgb, RgbImage};
use meanshift_vision::core_modules::numeric::{Numeric, Q16};
use meanshift_vision::core_modules::region::TrackedRegion;
use meanshift_vision::{FrameSink, TrackReport, TrackerConfig, TrackingPipeline, TrackingResult};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FRAME_WIDTH: u32 = 160;
const FRAME_HEIGHT: u32 = 120;
const OBJECT_SIZE: u32 = 9;
const BACKGROUND: Rgb<u8> = Rgb([20, 200, 200]);
const OBJECT: Rgb<u8> = Rgb([250, 30, 30]);
const SEQUENCE_LENGTH: usize = 40;

/// Top-left corner of the object in frame `index`.
fn object_origin(index: usize) -> (u32, u32) {
    let step = index as u32;
    (30 + 2 * step, 40 + step)
}

fn synthetic_frame(index: usize) -> RgbImage {
    let (ox, oy) = object_origin(index);
    RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
        let inside = (ox..ox + OBJECT_SIZE).contains(&x) && (oy..oy + OBJECT_SIZE).contains(&y);
        if inside { OBJECT } else { BACKGROUND }
    })
}

/// Logs each tracked region next to where the object really is.
struct LoggingSink;

impl FrameSink for LoggingSink {
    fn accept(&mut self, _frame: &RgbImage, report: &TrackReport) -> TrackingResult<()> {
        let (ox, oy) = object_origin(report.frame_index + 1);
        let outcome = &report.outcome;
        info!(
            frame = report.frame_index,
            region = %outcome.region,
            object_centre = ?(ox + OBJECT_SIZE / 2, oy + OBJECT_SIZE / 2),
            iterations = outcome.iterations,
            converged = outcome.converged,
            "tracked"
        );
        Ok(())
    }
}

async fn track_sequence<N: Numeric>(config: TrackerConfig) -> anyhow::Result<()> {
    let first = synthetic_frame(0);
    let (ox, oy) = object_origin(0);
    let centre = (ox + OBJECT_SIZE / 2) as i32;
    let middle = (oy + OBJECT_SIZE / 2) as i32;
    // Wider than tall, so the analysis window is the centred 16x16 slice.
    let region = TrackedRegion::new(centre - 12, middle - 8, 24, 16);

    let mut pipeline = TrackingPipeline::<N>::start(config, &first, region)
        .await
        .context("failed to start tracking pipeline")?;

    let frames = futures::stream::iter((1..=SEQUENCE_LENGTH).map(synthetic_frame));
    let processed = pipeline.run(frames, &mut LoggingSink).await?;

    let stats = pipeline.finish().await?;
    info!(processed, ?stats, backend = N::NAME, "done");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = TrackerConfig::from_env();
    info!(?config, "Mean-shift tracker - synthetic sequence");

    match std::env::var("MS_BACKEND").as_deref() {
        Ok("q16") => track_sequence::<Q16>(config).await,
        Ok("f32") | Err(_) => track_sequence::<f32>(config).await,
        Ok(other) => anyhow::bail!("unknown MS_BACKEND {other:?}, expected f32 or q16"),
    }
}
