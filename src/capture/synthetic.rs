//! Synthetic test-pattern source for `stub://` endpoints.
//!
//! Produces a moving gradient at a fixed pace so the whole acquisition path
//! can run without a camera. Query options:
//! `width`, `height`, `fps` (0 = unpaced) and `fail_every` (inject a read
//! failure on every Nth pull).

use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{
    CloseError, OpenError, ReadError, SourceAdapter, SourceHandle, StreamEndpoint,
};

pub const SCHEME: &str = "stub";

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_FPS: u32 = 30;
const MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticOptions {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fail_every: u64,
}

impl SyntheticOptions {
    pub fn from_endpoint(endpoint: &StreamEndpoint) -> Result<Self, OpenError> {
        if endpoint.scheme() != SCHEME {
            return Err(OpenError::UnsupportedEndpoint(endpoint.scheme().to_string()));
        }

        let options = Self {
            width: param(endpoint, "width", DEFAULT_WIDTH)?,
            height: param(endpoint, "height", DEFAULT_HEIGHT)?,
            fps: param(endpoint, "fps", DEFAULT_FPS)?,
            fail_every: param(endpoint, "fail_every", 0)?,
        };

        if options.width == 0 || options.height == 0 {
            return Err(OpenError::InvalidEndpoint(format!(
                "frame size {}x{} is empty",
                options.width, options.height
            )));
        }
        if options.width > MAX_DIMENSION || options.height > MAX_DIMENSION {
            return Err(OpenError::InvalidEndpoint(format!(
                "frame size {}x{} exceeds {}x{}",
                options.width, options.height, MAX_DIMENSION, MAX_DIMENSION
            )));
        }

        Ok(options)
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.fps > 0).then(|| Duration::from_secs_f64(1.0 / self.fps as f64))
    }
}

fn param<T: std::str::FromStr>(
    endpoint: &StreamEndpoint,
    key: &str,
    default: T,
) -> Result<T, OpenError> {
    match endpoint.query_param(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| OpenError::InvalidEndpoint(format!("`{key}={value}` is not a number"))),
    }
}

impl SourceAdapter for SyntheticSource {
    type Handle = SyntheticHandle;

    fn open(&self, endpoint: &StreamEndpoint) -> Result<SyntheticHandle, OpenError> {
        let options = SyntheticOptions::from_endpoint(endpoint)?;
        info!(
            "Synthetic source opened: {}x{} @ {} fps",
            options.width, options.height, options.fps
        );
        Ok(SyntheticHandle::new(options))
    }
}

/// Open synthetic stream
pub struct SyntheticHandle {
    options: SyntheticOptions,
    pulls: u64,
    sequence: u64,
    next_due: Option<Instant>,
}

impl SyntheticHandle {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            pulls: 0,
            sequence: 0,
            next_due: None,
        }
    }

    /// Sleep until the next frame slot; deadlines are absolute so pacing does not drift.
    fn pace(&mut self) {
        let Some(interval) = self.options.frame_interval() else {
            return;
        };

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now + interval);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due + interval);
    }

    fn render_pattern(&self) -> Vec<u8> {
        let width = self.options.width as usize;
        let height = self.options.height as usize;
        let shift = self.sequence as usize;

        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push(((y + shift) % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        pixels
    }
}

impl SourceHandle for SyntheticHandle {
    fn pull(&mut self) -> Result<Frame, ReadError> {
        self.pace();
        self.pulls += 1;

        if self.options.fail_every > 0 && self.pulls % self.options.fail_every == 0 {
            return Err(ReadError::Upstream(format!(
                "injected failure on pull {}",
                self.pulls
            )));
        }

        let meta = FrameMetadata::packed(
            self.sequence + 1,
            self.options.width,
            self.options.height,
            PixelFormat::Rgb24,
        )
        .ok_or_else(|| ReadError::Malformed("frame size overflows".into()))?;
        self.sequence += 1;
        Ok(Frame::new(self.render_pattern(), meta))
    }

    fn close(self) -> Result<(), CloseError> {
        info!("Synthetic source closed after {} pulls", self.pulls);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(endpoint: &str) -> Result<SyntheticHandle, OpenError> {
        SyntheticSource.open(&StreamEndpoint::new(endpoint).unwrap())
    }

    #[test]
    fn produces_packed_rgb_frames_in_sequence() {
        let mut handle = open("stub://pattern?width=8&height=4&fps=0").unwrap();

        let first = handle.pull().unwrap();
        let second = handle.pull().unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(first.meta.format, PixelFormat::Rgb24);
        assert_eq!(first.data.len(), 8 * 4 * 3);
        assert!(first.is_complete());
        assert_ne!(first.data, second.data);

        handle.close().unwrap();
    }

    #[test]
    fn injects_failures_on_schedule() {
        let mut handle = open("stub://pattern?width=2&height=2&fps=0&fail_every=3").unwrap();

        assert!(handle.pull().is_ok());
        assert!(handle.pull().is_ok());
        assert!(matches!(handle.pull(), Err(ReadError::Upstream(_))));
        // Failures do not consume sequence numbers
        assert_eq!(handle.pull().unwrap().sequence(), 3);
    }

    #[test]
    fn paces_to_requested_rate() {
        let mut handle = open("stub://pattern?width=2&height=2&fps=50").unwrap();

        let started = Instant::now();
        for _ in 0..5 {
            handle.pull().unwrap();
        }
        // Five 20ms slots
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn rejects_foreign_scheme_and_bad_options() {
        assert!(matches!(
            open("rtsp://camera/stream"),
            Err(OpenError::UnsupportedEndpoint(_))
        ));
        assert!(matches!(
            open("stub://pattern?width=abc"),
            Err(OpenError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            open("stub://pattern?width=0"),
            Err(OpenError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn rejects_oversized_frames_at_open() {
        assert!(matches!(
            open("stub://pattern?width=2000000000"),
            Err(OpenError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            open("stub://pattern?width=16&height=20000"),
            Err(OpenError::InvalidEndpoint(_))
        ));
        assert!(open("stub://pattern?width=16384&height=1&fps=0").is_ok());
    }
}
