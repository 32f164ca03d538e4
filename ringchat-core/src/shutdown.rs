use tokio::sync::broadcast;

/// Owning side of the node-wide stop signal.
///
/// The server supervisor holds one of these and fires it when the node is
/// asked to stop; subscribers also release if the last notifier is
/// dropped, so an early supervisor exit still winds every task down.
#[derive(Clone, Debug)]
pub struct ShutdownNotify {
    notify: broadcast::Sender<()>,
}

impl ShutdownNotify {
    pub fn new() -> ShutdownNotify {
        let (notify, _) = broadcast::channel(1);
        ShutdownNotify { notify }
    }

    /// Hands out a listener for one long-lived task: a connection
    /// handler, the discovery loops, the heartbeat loop.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify: self.notify.subscribe(),
        }
    }

    pub fn notify(&self) {
        let _ = self.notify.send(());
    }
}

impl Default for ShutdownNotify {
    fn default() -> Self {
        ShutdownNotify::new()
    }
}

/// Task-side listener. The signal latches: after the first `recv` returns,
/// `is_shutdown` stays true and further `recv` calls resolve immediately.
#[derive(Debug)]
pub struct Shutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_notify_releases_subscribers() {
        let notify = ShutdownNotify::new();
        let mut shutdown = notify.subscribe();
        assert!(!shutdown.is_shutdown());
        notify.notify();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // latched: a second recv resolves immediately
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_dropping_all_notifiers_releases_subscribers() {
        let notify = ShutdownNotify::new();
        let mut shutdown = notify.subscribe();
        drop(notify);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
