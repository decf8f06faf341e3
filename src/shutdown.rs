use std::process;

use tokio::sync::mpsc;
use tracing::{error, info};

/// Turns ctrl-c and SIGTERM into a process exit once the current write has finished
pub struct ShutdownManager {
    rx: mpsc::Receiver<()>,
}

impl ShutdownManager {
    /// Install the signal listeners, must be called from within the runtime
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);

        let ctrl_c = tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                // printing to stdout here can fail with a broken pipe
                Ok(()) => {
                    let _ = ctrl_c.send(()).await;
                }
                Err(err) => error!("error listening for ctrl+c: {err}"),
            }
        });

        #[cfg(unix)]
        {
            let term = tx.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{SignalKind, signal};

                match signal(SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                        let _ = term.send(()).await;
                    }
                    Err(err) => error!("error installing SIGTERM handler: {err}"),
                }
            });
        }

        ShutdownManager { rx }
    }

    /// Exit the process on the first shutdown signal. Progress since the last checkpoint is
    /// indexed again on the next start.
    pub fn exit_on_signal(mut self) {
        tokio::spawn(async move {
            if self.rx.recv().await.is_some() {
                info!("shutdown signal received, exiting");
                process::exit(0);
            }
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
