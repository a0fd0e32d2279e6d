pub mod render;
pub mod sink;

pub use render::{run_render_loop, RenderSummary};
pub use sink::{LogSink, RenderError, RenderSink};
