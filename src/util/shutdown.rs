use tokio::sync::{mpsc, watch};
use tracing::debug;

// Shutdown notifier, waits for every listener to let go before returning
pub struct Notifier {
    // Shutdown signal broadcast
    sender: watch::Sender<bool>,
    // Wait for things to finish shutdown
    waiter: (Option<mpsc::Sender<()>>, mpsc::Receiver<()>),
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        let (tx, rx) = mpsc::channel(1);

        Notifier {
            sender,
            waiter: (Some(tx), rx),
        }
    }

    // Broadcast the signal and block until all listeners are dropped
    pub async fn notify(&mut self) {
        debug!("shutdown notifying...");
        // It's ok if send failed, there's no listener working
        self.sender.send(true).ok();
        self.waiter.0.take();
        self.waiter.1.recv().await;
        debug!("shutdown complete");
    }

    // Create a shutdown signal listener, None once notify has started
    #[inline]
    pub fn listen(&self) -> Option<Listener> {
        self.waiter.0.as_ref().map(|sender| Listener {
            listener: self.sender.subscribe(),
            _finisher: sender.clone(),
        })
    }
}

pub struct Listener {
    listener: watch::Receiver<bool>,
    // Notifier is released when every finisher is dropped
    _finisher: mpsc::Sender<()>,
}

impl Listener {
    // Resolves once the shutdown signal is sent or the notifier is gone
    #[inline]
    pub async fn listen(&mut self) {
        if *self.listener.borrow() {
            return;
        }
        // An error means the notifier was dropped, which is a shutdown too
        self.listener.changed().await.ok();
    }
}
