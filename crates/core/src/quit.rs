/// One-shot broadcast stop signal
///
/// A `QuitTrigger` fires at most once: `fire` consumes it, and dropping an
/// unfired trigger fires it too. Any number of `QuitSignal` clones observe
/// the transition. Build a fresh pair for every proxy generation so a signal
/// fired for an old generation can never reach a new one.

use tokio::sync::watch;

/// Firing half; not `Clone`
#[derive(Debug)]
pub struct QuitTrigger {
    tx: watch::Sender<bool>,
}

/// Observing half
#[derive(Debug, Clone)]
pub struct QuitSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked trigger/signal pair
pub fn quit_channel() -> (QuitTrigger, QuitSignal) {
    let (tx, rx) = watch::channel(false);
    (QuitTrigger { tx }, QuitSignal { rx })
}

impl QuitTrigger {
    /// Fire the signal; every observer wakes
    pub fn fire(self) {
        self.tx.send_replace(true);
    }
}

impl QuitSignal {
    /// Whether the trigger has fired (or was dropped)
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until the trigger fires; returns immediately if it already has
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        // Err means the trigger was dropped, which counts as fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
