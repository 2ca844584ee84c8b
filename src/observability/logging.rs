//! Structured logging setup.
//!
//! The supervisor logs to stdout directly. Workers route their `fmt` output
//! through a `MakeWriter` that turns each line into an IPC `log` message.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("route_machine={level},tower_http=warn,access_log=info").into())
}

/// Initialize logging for the supervisor process.
pub fn init_supervisor(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Initialize logging for a worker process, writing through `writer`.
pub fn init_worker<W>(level: &str, writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .without_time(),
        )
        .try_init();
}
