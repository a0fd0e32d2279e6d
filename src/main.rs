//! Argus: latest-frame viewer for network camera streams

use std::path::PathBuf;
use std::sync::Arc;

use argus::capture::AnySource;
use argus::display::{run_render_loop, LogSink};
use argus::{AcquisitionService, Config, StreamEndpoint};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    // Load configuration: optional TOML path as the only argument
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    argus::CONFIG.store(Arc::new(config.clone()));

    let endpoint = StreamEndpoint::new(config.stream.endpoint.as_str())?;
    info!("Using stream endpoint: {}", endpoint);

    // Open the stream and start background acquisition; open failures abort startup
    let source = AnySource::new(&config.stream);
    let service = AcquisitionService::default();
    service.start(&source, &endpoint)?;

    let mut sink = LogSink::new(config.render.report_interval(), config.render.max_frames);
    let summary = run_render_loop(&service, &mut sink, config.render.cadence(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    service.stop();

    let stats = service.stats();
    info!(
        "Rendered {} frames ({} repeats, {} errors); acquired {} frames, {} failed reads",
        summary.rendered,
        summary.repeats,
        summary.errors,
        stats.frames_published,
        stats.read_failures
    );
    info!("Argus shutting down");
    Ok(())
}
