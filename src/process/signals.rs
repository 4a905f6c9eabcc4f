use tokio::sync::mpsc;
use tracing::{info, warn};

/// Turn SIGINT/SIGTERM (Ctrl-C elsewhere) into shutdown notifications for
/// `Supervisor::attach_signal_source`. Every delivered signal produces one
/// notification; the supervisor acts on the first.
pub fn os_signal_source() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            loop {
                tokio::select! {
                    Some(()) = sigterm.recv() => info!("Received SIGTERM"),
                    Some(()) = sigint.recv() => info!("Received SIGINT"),
                    else => break,
                }
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        }

        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        }
    });

    rx
}
