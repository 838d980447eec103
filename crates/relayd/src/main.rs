use anyhow::Context;
use clap::Parser;
use relayd::config::{Config, DiagnosticFormat, Opt};
use relayd::metrics::RelayMetrics;
use relayd::smtp_server::SmtpServer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    if opts.version {
        println!("Version: {}", version_info::relayd_version());
        println!("Git Commit: {}", version_info::relayd_commit());
        println!("Build Time: {}", version_info::relayd_build_timestamp());
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("initialize tokio runtime")?
        .block_on(async move { run(opts).await })
}

fn init_logging(opts: &Opt) {
    let layer = fmt::layer().with_thread_names(true);
    let layer = match opts.diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    let debug = opts.debug || relayd::config::parse_env_bool("DEBUG", false);
    let filter = EnvFilter::try_from_env("RELAYD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    tracing_subscriber::registry().with(layer).with(filter).init();
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    init_logging(&opts);

    let config = Arc::new(Config::load(&opts));
    anyhow::ensure!(config.metrics_port != 0, "metrics port must be set");

    let metrics = Arc::new(RelayMetrics::new()?);

    relayd::http_server::start(
        &format!("0.0.0.0:{}", config.metrics_port),
        Arc::clone(&metrics),
    )?;

    let hostname = gethostname::gethostname()
        .to_str()
        .unwrap_or("localhost")
        .to_string();

    let listener = TcpListener::bind(("0.0.0.0", config.smtp_port))
        .await
        .with_context(|| format!("failed to bind to port {}", config.smtp_port))?;
    tracing::info!("smtp listener on port {}", config.smtp_port);

    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .context("accept inbound connection")?;
        tracing::debug!("accepted connection from {peer}");
        // Each session runs on its own task; a slow upstream only
        // stalls the connection that is waiting on it.
        let _session = SmtpServer::run(
            socket,
            hostname.clone(),
            Arc::clone(&config),
            Arc::clone(&metrics),
        );
    }
}
