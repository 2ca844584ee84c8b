//! OS signal handling.
//!
//! SIGINT and SIGTERM both mean "stop": the supervisor kills its workers
//! and exits, a worker stops accepting and exits.

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Interrupt => f.write_str("SIGINT"),
            Termination::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_termination() -> std::io::Result<Termination> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| Termination::Interrupt),
            _ = term.recv() => Ok(Termination::Terminate),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(Termination::Interrupt)
    }
}
