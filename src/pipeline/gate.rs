use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{TranslateError, TranslateResult};

/// Pause switch checked by the job loop between documents.
///
/// `pause`/`resume` only flip the state; the loop blocks in [`PauseGate::wait`] until
/// the gate is open again or the job is cancelled.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Return once the gate is open. Cancellation wins over a pending resume.
    pub async fn wait(&self, cancel: &CancellationToken) -> TranslateResult<()> {
        self.wait_with(cancel, || {}).await
    }

    /// Like [`PauseGate::wait`], calling `on_block` exactly when the gate turns out to be
    /// closed, before blocking. The state is read from the same receiver that is then
    /// awaited, so a pause is never observed without `on_block` running.
    pub async fn wait_with(
        &self,
        cancel: &CancellationToken,
        on_block: impl FnOnce(),
    ) -> TranslateResult<()> {
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        let mut rx = self.tx.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(());
        }
        on_block();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TranslateError::Cancelled),
            open = rx.wait_for(|paused| !*paused) => {
                open.map(|_| ()).map_err(|_| TranslateError::Cancelled)
            }
        }
    }
}
