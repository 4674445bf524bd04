/// Process signal handling
///
/// SIGINT or SIGTERM (Ctrl-C on other platforms) fires the process-wide
/// quit trigger; the supervisor observes it and tears the tunnel down.

use sshsocks_core::QuitTrigger;
use std::future::Future;
use std::io;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Spawn the listener that fires `trigger` on the first termination signal
pub fn install(trigger: QuitTrigger) -> JoinHandle<()> {
    tokio::spawn(forward(trigger, wait_for_signal()))
}

/// Fire `trigger` once `signal` resolves successfully.
///
/// If the handler could not be registered the trigger is kept alive, since
/// dropping it would count as a shutdown request.
pub async fn forward<F>(trigger: QuitTrigger, signal: F)
where
    F: Future<Output = io::Result<&'static str>>,
{
    match signal.await {
        Ok(name) => {
            info!("Received {}, shutting down", name);
            trigger.fire();
        }
        Err(e) => {
            error!("Failed to install signal handler: {}", e);
            std::future::pending::<()>().await;
            drop(trigger);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshsocks_core::quit_channel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_trigger() {
        let (trigger, signal) = quit_channel();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(forward(trigger, async move {
            let _ = rx.await;
            Ok("SIGTERM")
        }));
        assert!(!signal.is_fired());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.fired())
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_running() {
        let (trigger, signal) = quit_channel();

        let task = tokio::spawn(forward(trigger, async {
            Err(io::Error::new(io::ErrorKind::Other, "no signals here"))
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!signal.is_fired());
        task.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_is_observed() {
        let (trigger, signal) = quit_channel();
        let task = install(trigger);

        // Let the handler register before raising.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pid = std::process::id().to_string();
        std::process::Command::new("kill")
            .args(["-TERM", &pid])
            .status()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), signal.fired())
            .await
            .unwrap();
        task.await.unwrap();
    }
}
