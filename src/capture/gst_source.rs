//! GStreamer-based network stream source (RTSP, HTTP, file URIs)

use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{
    CloseError, OpenError, ReadError, SourceAdapter, SourceHandle, StreamEndpoint,
};
use crate::StreamConfig;

/// Elements every decode pipeline needs regardless of transport
const REQUIRED_ELEMENTS: [&str; 4] = ["decodebin", "videoconvert", "appsink", "queue"];

/// Opens GStreamer decode pipelines ending in an RGB appsink
#[derive(Debug, Clone)]
pub struct GstSource {
    pull_timeout: Duration,
    latency_ms: u32,
}

impl GstSource {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            pull_timeout: config.pull_timeout(),
            latency_ms: config.latency_ms,
        }
    }

    /// Build pipeline string for the endpoint's transport
    fn build_pipeline_string(&self, endpoint: &StreamEndpoint) -> Result<String, OpenError> {
        let location = endpoint.as_str().replace('"', "\\\"");

        let head = match endpoint.scheme() {
            "rtsp" | "rtsps" | "rtspt" => {
                Self::require_element("rtspsrc", endpoint)?;
                format!(
                    "rtspsrc location=\"{}\" latency={} name=source ! decodebin",
                    location, self.latency_ms
                )
            }
            "http" | "https" | "file" => {
                Self::require_element("uridecodebin", endpoint)?;
                format!("uridecodebin uri=\"{}\" name=source", location)
            }
            other => return Err(OpenError::UnsupportedEndpoint(other.to_string())),
        };

        Ok(format!(
            "{} ! \
             queue max-size-buffers=2 leaky=downstream ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink",
            head
        ))
    }

    /// Missing plugins are reported at open time, not on the first pull
    fn require_element(name: &str, endpoint: &StreamEndpoint) -> Result<(), OpenError> {
        match gst::ElementFactory::find(name) {
            Some(factory) => {
                debug!(
                    "Found element: {} - {}",
                    name,
                    factory.metadata("long-name").unwrap_or("")
                );
                Ok(())
            }
            None => {
                warn!("GStreamer element {} is not installed", name);
                Err(OpenError::BackendUnavailable(endpoint.scheme().to_string()))
            }
        }
    }
}

impl SourceAdapter for GstSource {
    type Handle = GstHandle;

    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    fn open(&self, endpoint: &StreamEndpoint) -> Result<GstHandle, OpenError> {
        gst::init().map_err(|e| OpenError::BackendUnavailable(format!("gstreamer: {}", e)))?;

        for element in REQUIRED_ELEMENTS {
            Self::require_element(element, endpoint)?;
        }

        let pipeline_str = self.build_pipeline_string(endpoint)?;
        debug!("Pipeline: {}", pipeline_str.replace(endpoint.as_str(), &endpoint.to_string()));

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| OpenError::Pipeline(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| OpenError::Pipeline("launch did not yield a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| OpenError::Pipeline("appsink element missing".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| OpenError::Pipeline("appsink element has unexpected type".into()))?;

        // Keep only the newest decoded buffer; the acquisition slot drops the rest anyway
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let mut handle = GstHandle {
            pipeline,
            appsink,
            pull_timeout: self.pull_timeout,
            sequence: 0,
            closed: false,
        };
        handle.start_stream(endpoint)?;
        Ok(handle)
    }
}

/// Running decode pipeline
pub struct GstHandle {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    pull_timeout: Duration,
    sequence: u64,
    closed: bool,
}

impl GstHandle {
    fn start_stream(&mut self, endpoint: &StreamEndpoint) -> Result<(), OpenError> {
        info!("Starting GStreamer pipeline for {}", endpoint);

        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            let _ = self.pipeline.set_state(gst::State::Null);
            return Err(OpenError::Unreachable(format!("{}: {:?}", endpoint, e)));
        }

        // Live sources report NoPreroll; a refused connection surfaces as a failure here
        let (state_change, _, _) = self.pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Pipeline started");
                Ok(())
            }
            Ok(gst::StateChangeSuccess::Async) => {
                info!("Pipeline starting asynchronously");
                Ok(())
            }
            Err(_) => {
                let reason = self
                    .drain_bus()
                    .err()
                    .map_or_else(|| "state change failed".to_string(), |e| e.to_string());
                let _ = self.pipeline.set_state(gst::State::Null);
                Err(OpenError::Unreachable(format!("{}: {}", endpoint, reason)))
            }
        }
    }

    /// Surface pending bus errors and EOS as read errors
    fn drain_bus(&self) -> Result<(), ReadError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };

        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            use gst::MessageView;

            match message.view() {
                MessageView::Error(err) => {
                    return Err(ReadError::Upstream(format!(
                        "{} ({:?})",
                        err.error(),
                        err.src().map(|s| s.path_string())
                    )));
                }
                MessageView::Eos(..) => return Err(ReadError::EndOfStream),
                MessageView::Warning(w) => warn!("GStreamer warning: {}", w.error()),
                _ => {}
            }
        }
        Ok(())
    }

    fn sample_to_frame(&mut self, sample: &gst::Sample, timestamp: Instant) -> Result<Frame, ReadError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| ReadError::Malformed("sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| ReadError::Malformed("sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| ReadError::Malformed("caps are not raw video".into()))?;

        let width = video_info.width();
        let height = video_info.height();
        let row_bytes = width as usize * 3;
        let stride = video_info.stride()[0] as usize;

        let map = buffer
            .map_readable()
            .map_err(|_| ReadError::Malformed("buffer is not readable".into()))?;
        let data = map.as_slice();

        // Repack padded rows so frames are always tightly packed
        let pixels = if stride == row_bytes {
            Bytes::copy_from_slice(data.get(..row_bytes * height as usize).unwrap_or(data))
        } else {
            let mut packed = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                let line = data
                    .get(start..start + row_bytes)
                    .ok_or_else(|| ReadError::Malformed(format!("row {} out of bounds", row)))?;
                packed.extend_from_slice(line);
            }
            Bytes::from(packed)
        };

        let meta = FrameMetadata::packed(self.sequence + 1, width, height, PixelFormat::Rgb24)
            .ok_or_else(|| ReadError::Malformed(format!("{}x{} is too large", width, height)))?;
        self.sequence += 1;
        let frame = Frame {
            data: pixels,
            meta,
            timestamp,
        };

        if !frame.is_complete() {
            return Err(ReadError::Malformed(format!(
                "{} bytes for {}x{}",
                frame.data.len(),
                width,
                height
            )));
        }
        Ok(frame)
    }

    fn stop_stream(&mut self) -> Result<(), CloseError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        info!("Stopping GStreamer pipeline");
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| CloseError(format!("{:?}", e)))?;
        Ok(())
    }
}

impl SourceHandle for GstHandle {
    fn pull(&mut self) -> Result<Frame, ReadError> {
        self.drain_bus()?;

        let sample = match self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(self.pull_timeout.as_millis() as u64))
        {
            Some(sample) => sample,
            None if self.appsink.is_eos() => return Err(ReadError::EndOfStream),
            None => return Err(ReadError::Timeout(self.pull_timeout)),
        };

        self.sample_to_frame(&sample, Instant::now())
    }

    fn close(mut self) -> Result<(), CloseError> {
        self.stop_stream()
    }
}

impl Drop for GstHandle {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}
