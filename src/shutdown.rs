use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel a token when SIGTERM or SIGINT arrives.
///
/// The spool treats a cancelled token as "stop now": dispatched processes are
/// terminated and the live array batch is cancelled.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping spool");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping spool");
            }
        }

        token_clone.cancel();
    });

    token
}
