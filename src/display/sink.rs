//! Render sinks: where the render loop hands the latest frame

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

use crate::capture::Frame;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unsupported frame: {0}")]
    Unsupported(String),
    #[error("render surface failed: {0}")]
    Surface(String),
}

/// Display surface driven by the render loop
pub trait RenderSink {
    /// Show `frame`; `rate` is the acquisition FPS at the time of the call.
    fn render(&mut self, frame: &Frame, rate: f64) -> Result<(), RenderError>;

    /// Polled once per render tick, e.g. from keyboard or window events.
    fn quit_requested(&mut self) -> bool {
        false
    }
}

/// Headless sink that reports what it would have drawn
pub struct LogSink {
    report_interval: Duration,
    max_frames: u64,
    rendered: u64,
    rendered_at_report: u64,
    last_report: Option<Instant>,
}

impl LogSink {
    /// `max_frames` of 0 never requests quit.
    pub fn new(report_interval: Duration, max_frames: u64) -> Self {
        Self {
            report_interval,
            max_frames,
            rendered: 0,
            rendered_at_report: 0,
            last_report: None,
        }
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }
}

impl RenderSink for LogSink {
    fn render(&mut self, frame: &Frame, rate: f64) -> Result<(), RenderError> {
        if !frame.is_complete() {
            return Err(RenderError::Unsupported(format!(
                "frame {} carries {} of {} bytes",
                frame.sequence(),
                frame.data.len(),
                frame.meta.expected_len()
            )));
        }

        self.rendered += 1;

        let now = Instant::now();
        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.report_interval);
        if due {
            info!(
                "frame #{} {}x{} {:?} age {:.1} ms | acquisition {:.1} fps | rendered {} since last report",
                frame.sequence(),
                frame.meta.width,
                frame.meta.height,
                frame.meta.format,
                frame.age().as_secs_f64() * 1000.0,
                rate,
                self.rendered - self.rendered_at_report
            );
            self.rendered_at_report = self.rendered;
            self.last_report = Some(now);
        }
        Ok(())
    }

    fn quit_requested(&mut self) -> bool {
        self.max_frames > 0 && self.rendered >= self.max_frames
    }
}
