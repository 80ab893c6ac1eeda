// JDWP event monitor
//
// Attaches to a JVM, installs the event requests of a watch file and prints
// every delivered event set as a JSON line until the target goes away.

use anyhow::{Context, Result};
use clap::Parser;
use jdwp_engine::{DebugSession, JdwpConnection, JdwpError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod printer;
mod watch;

use printer::JsonLinePrinter;
use watch::WatchFile;

#[derive(Debug, Parser)]
#[command(name = "jdwp-monitor", version, about = "Print JDWP events as JSON lines")]
struct Args {
    /// Watch file describing the requests to install
    #[arg(long)]
    watch: PathBuf,

    /// Overrides the watch file's host
    #[arg(long)]
    host: Option<String>,

    /// Overrides the watch file's port
    #[arg(long)]
    port: Option<u16>,

    /// Leave event sets suspended instead of resuming them
    #[arg(long)]
    hold: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout is reserved for event output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jdwp_monitor=info".parse()?)
                .add_directive("jdwp_engine=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let watch = WatchFile::load(&args.watch)?;
    let host = args.host.unwrap_or_else(|| watch.host.clone());
    let port = args.port.unwrap_or(watch.port);

    let (connection, events) = JdwpConnection::connect(&host, port, &watch.engine)
        .await
        .with_context(|| format!("Failed to attach to {}:{}", host, port))?;

    let session = DebugSession::new(connection, events, watch.engine.clone());
    session.add_listener(Arc::new(JsonLinePrinter::new(std::io::stdout(), args.hold)));
    for request in &watch.requests {
        let id = session.requests().create(request.to_builder()?)?;
        info!("Watching {} as request {}", request.kind, id);
    }
    let session = session.launch().await?;
    let mut stream = session.subscribe();

    info!("Monitoring {}:{}", host, port);

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Ok(_) | Err(JdwpError::Timeout(_)) => {}
                Err(JdwpError::ConnectionClosed) => break,
                Err(e) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, detaching");
                session.detach().await?;
                break;
            }
        }
    }

    match session.disconnect_cause() {
        Some(cause) if cause.is_failure() => {
            error!("Session ended: {}", cause);
            std::process::exit(1);
        }
        Some(cause) => info!("Session ended: {}", cause),
        None => {}
    }
    Ok(())
}
