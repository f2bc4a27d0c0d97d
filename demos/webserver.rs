//! Serves the file shares named in a TOML config, with virtual hosts and
//! access logs.
//!
//! ```text
//! cargo run --example webserver -- --config httpd.toml
//! ```
//! Press enter to shut down.

use clap::Parser;
use pool_httpd::{
    config::DaemonConfig,
    events::{logger::AccessLogger, EventClass, TracingEvents},
    handlers::fileshare::FileShare,
    HttpDaemon,
};
use std::{error::Error, io::BufRead, path::PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "webserver", about = "Multi-threaded file server")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "httpd.toml")]
    config: PathBuf,

    /// Overrides `listen` from the config
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pool_httpd=info,webserver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::from_file(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let mut builder = HttpDaemon::builder()
        .listener(config.listener()?)
        .daemon_limits(config.daemon_limits())
        .connection_limits(config.connection_limits())
        .request_limits(config.request_limits());

    if let Some(path) = &config.system_path {
        builder = builder.system_path(path.clone());
    }
    for (status, path) in config.default_documents()? {
        builder = builder.default_document(status, path);
    }
    if let Some(vhosts) = config.virtual_host() {
        builder = builder.handler("*", vhosts);
    }
    for share in &config.shares {
        builder = builder.handler(share.path.as_str(), FileShare::new(&share.root)?);
    }

    let log = &config.log;
    if log.access.is_some() || log.error.is_some() {
        builder = builder.event_handler(AccessLogger::open(
            log.access.as_ref(),
            log.error.as_ref(),
            config.rotation(),
        )?);
    } else {
        builder = builder.event_handler(TracingEvents::new(EventClass::ACCESS | EventClass::ERROR));
    }

    let daemon = builder.build()?;
    daemon.start()?;
    tracing::info!(listen = %config.listen, shares = config.shares.len(), "serving");

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    tracing::info!("shutting down");
    if !daemon.shutdown() {
        tracing::warn!("workers did not stop in time");
    }
    Ok(())
}
