use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use skyguide_server::{register_guiding_methods, EventServer, MethodRegistry, ServerConfig, SimulatedGuider};
use skyguide_telemetry::{init_telemetry, TelemetryConfig};

/// Guiding event server backed by a simulated camera and mount.
#[derive(Parser, Debug)]
#[command(name = "skyguide", version)]
struct Args {
    /// Instance number; instance n listens on base port + n - 1.
    #[arg(long, default_value_t = 1)]
    instance: u32,

    /// Base port for instance 1.
    #[arg(long, default_value_t = 4400)]
    port: u16,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Longest accepted request line, in bytes.
    #[arg(long, default_value_t = 1024)]
    max_frame_len: usize,

    /// Default log level (RUST_LOG overrides).
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Do not advance the simulated guider on its own.
    #[arg(long)]
    no_tick: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        json: args.json_logs,
        ..Default::default()
    });
    let metrics = telemetry.metrics();

    let config = ServerConfig {
        bind_host: args.bind,
        base_port: args.port,
        max_frame_len: args.max_frame_len,
        ..Default::default()
    };

    let broadcaster = config.broadcaster(metrics.clone());
    let guider = Arc::new(SimulatedGuider::new(broadcaster.clone()));
    let mut methods = MethodRegistry::new();
    register_guiding_methods(&mut methods, guider.clone());

    let mut server = EventServer::new(config, methods, guider.clone(), broadcaster).with_metrics(metrics.clone());
    let addr = server
        .start_instance(args.instance)
        .await
        .with_context(|| format!("starting event server instance {}", args.instance))?;
    tracing::info!(addr = %addr, instance = args.instance, "skyguide ready");

    let ticker = (!args.no_tick).then(|| {
        let guider = Arc::clone(&guider);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(guider.frame_interval().max(Duration::from_millis(50))).await;
                guider.tick();
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    server.stop().await;

    if let Some(metrics) = metrics {
        for sample in metrics.snapshot() {
            tracing::debug!(name = %sample.name, value = sample.value, "final metric");
        }
    }
    Ok(())
}
