//! One-shot completion signals used to order dependent tasks.

use std::sync::Arc;

use tokio::sync::watch;

/// Broadcast that fires once and stays fired.
///
/// A waiter that subscribes after the signal fired returns immediately.
#[derive(Clone)]
pub(crate) struct CompletionSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Fires the signal when dropped, so dependents are released even if the
/// owning task panics or is aborted.
pub(crate) struct FireOnDrop(pub(crate) CompletionSignal);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}
