//! Render loop: pulls the latest frame at display cadence, independent of acquisition

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::capture::Frame;
use crate::display::sink::RenderSink;
use crate::pipeline::AcquisitionService;

/// What the render loop did before it exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub ticks: u64,
    pub rendered: u64,
    /// Ticks where the slot still held the frame rendered last time
    pub repeats: u64,
    pub errors: u64,
}

/// Render the service's latest frame every `cadence` until the sink asks to
/// quit or `shutdown` resolves.
///
/// Each distinct frame is rendered at most once; ticks with nothing new are
/// skipped. Sink errors are logged and the loop carries on.
pub async fn run_render_loop<S, F>(
    service: &AcquisitionService,
    sink: &mut S,
    cadence: Duration,
    shutdown: F,
) -> RenderSummary
where
    S: RenderSink + ?Sized,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut summary = RenderSummary::default();
    let mut last: Option<Arc<Frame>> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                summary.ticks += 1;

                if sink.quit_requested() {
                    info!("Quit requested by render sink");
                    break;
                }

                let Some(frame) = service.latest() else {
                    continue;
                };
                if last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &frame)) {
                    summary.repeats += 1;
                    continue;
                }

                metrics::histogram!("render_frame_age_ms")
                    .record(frame.age().as_secs_f64() * 1000.0);

                match sink.render(&frame, service.current_rate()) {
                    Ok(()) => summary.rendered += 1,
                    Err(e) => {
                        summary.errors += 1;
                        warn!("Render error: {}", e);
                    }
                }
                last = Some(frame);
            }
        }
    }

    summary
}
