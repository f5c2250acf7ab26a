use tokio::{sync::watch, task::JoinHandle};
use tracing::error;

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

pub fn trigger(sender: &ShutdownSender) {
    let _ = sender.send(true);
}

pub fn is_triggered(receiver: &ShutdownReceiver) -> bool {
    *receiver.borrow()
}

pub async fn wait(mut receiver: ShutdownReceiver) {
    if *receiver.borrow() {
        return;
    }

    while receiver.changed().await.is_ok() {
        if *receiver.borrow() {
            break;
        }
    }
}

/// Triggers `sender` when the process receives ctrl-c.
pub fn spawn_ctrl_c(sender: ShutdownSender, service: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, service, "unable to listen for ctrl_c");
        }
        trigger(&sender);
    })
}
