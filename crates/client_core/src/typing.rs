use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{domain::UserId, protocol::ClientFrame};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::debug;

/// Local typing debounce, one state machine per receiver.
///
/// The first keystroke after an idle period emits `typing` immediately and
/// arms a stop timer; every further keystroke re-arms it; expiry or an
/// explicit stop (send, input cleared) emits `stop_typing`. Timer handles are
/// owned here and aborted on every reset and on shutdown, so no timer
/// outlives the tracker.
pub struct TypingTracker {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    idle_window: Duration,
    timers: Arc<Mutex<HashMap<UserId, JoinHandle<()>>>>,
}

impl TypingTracker {
    pub fn new(outbound: mpsc::UnboundedSender<ClientFrame>, idle_window: Duration) -> Self {
        Self {
            outbound,
            idle_window,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a keystroke towards `receiver`.
    pub async fn keystroke(&self, receiver: &UserId) {
        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.remove(receiver) {
            previous.abort();
        } else {
            let _ = self.outbound.send(ClientFrame::Typing {
                receiver_id: receiver.clone(),
            });
        }

        let outbound = self.outbound.clone();
        let timers_ref = Arc::clone(&self.timers);
        let target = receiver.clone();
        let idle_window = self.idle_window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_window).await;
            // Still registered means no newer keystroke superseded this timer.
            let expired = timers_ref.lock().await.remove(&target).is_some();
            if expired {
                debug!(receiver = %target, "typing idle window elapsed");
                let _ = outbound.send(ClientFrame::StopTyping {
                    receiver_id: target,
                });
            }
        });
        timers.insert(receiver.clone(), handle);
    }

    /// Stop typing towards `receiver` immediately (message sent, or the
    /// input was cleared).
    pub async fn stopped(&self, receiver: &UserId) {
        let mut timers = self.timers.lock().await;
        if let Some(handle) = timers.remove(receiver) {
            handle.abort();
            let _ = self.outbound.send(ClientFrame::StopTyping {
                receiver_id: receiver.clone(),
            });
        }
    }

    /// Abort every armed timer without emitting; teardown path.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}
