//! Timer management for the runner.
//!
//! Each armed timer is a tokio task that sleeps and then sends the
//! matching event into the controller channel. Re-arming a timer cancels
//! the previous task.

use filament_core::{NodeEvent, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

fn timer_event(id: TimerId) -> NodeEvent {
    match id {
        TimerId::Heartbeat => NodeEvent::HeartbeatTimer,
        TimerId::Join => NodeEvent::JoinTimer,
    }
}

/// Manages the runner's timers.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<NodeEvent>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<NodeEvent>) -> Self {
        TimerManager {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm `id` to fire after `duration`, replacing any existing timer
    /// with the same id.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = event_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
        trace!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer; no-op if it is not armed or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    /// Cancel everything; called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            debug!(?id, "Timer cancelled (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Heartbeat, Duration::from_millis(10));
        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, NodeEvent::HeartbeatTimer));
    }

    #[tokio::test]
    async fn cancelled_timer_stays_silent() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Heartbeat, Duration::from_millis(50));
        manager.cancel_timer(TimerId::Heartbeat);

        let result = tokio::time::timeout(Duration::from_millis(120), event_rx.recv()).await;
        assert!(result.is_err(), "timer should have been cancelled");
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_timer() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Join, Duration::from_millis(200));
        manager.set_timer(TimerId::Join, Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(100), event_rx.recv())
            .await
            .expect("replacement timer did not fire quickly")
            .expect("channel closed");
        assert!(matches!(event, NodeEvent::JoinTimer));
    }
}
