//! Signal handling for the long-running commands.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returns a token cancelled on the first SIGINT / SIGTERM. A second signal
/// exits the process immediately.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(sig) => Some(sig),
                Err(err) => {
                    warn!(error = %err, "failed to register SIGTERM handler");
                    None
                }
            }
        };

        loop {
            #[cfg(unix)]
            {
                let term = async {
                    match sigterm.as_mut() {
                        Some(sig) => {
                            sig.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            warn!(error = %err, "failed to listen for ctrl-c");
                            return;
                        }
                    }
                    _ = term => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to listen for ctrl-c");
                    return;
                }
            }

            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                info!("shutting down; signal again to force exit");
                handler_token.cancel();
            } else {
                warn!("force exit requested");
                std::process::exit(130);
            }
        }
    });

    token
}
