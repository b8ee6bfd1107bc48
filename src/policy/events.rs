use super::StrategyId;
use std::sync::Mutex;
use tracing::info;

/// Notifications toward the learning engine and UI. Fire-and-forget.
pub trait PolicyEvents: Send + Sync {
    fn on_output_message(&self, _text: &str) {}

    fn on_lock(&self, _host: &str, _strategy: StrategyId) {}

    /// The host must re-enter automatic strategy discovery.
    fn on_unlock(&self, _host: &str) {}
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl PolicyEvents for NoopEvents {}

/// Routes notifications into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEvents;

impl PolicyEvents for LogEvents {
    fn on_output_message(&self, text: &str) {
        info!(target: "strategy_policy", "{}", text);
    }

    fn on_lock(&self, host: &str, strategy: StrategyId) {
        info!(target: "strategy_policy", host, strategy, "strategy locked");
    }

    fn on_unlock(&self, host: &str) {
        info!(target: "strategy_policy", host, "strategy unlocked");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    Output(String),
    Lock(String, StrategyId),
    Unlock(String),
}

/// Keeps every notification in order. Useful for embedding hosts that poll.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<PolicyEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<PolicyEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn push(&self, event: PolicyEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl PolicyEvents for RecordingEvents {
    fn on_output_message(&self, text: &str) {
        self.push(PolicyEvent::Output(text.to_string()));
    }

    fn on_lock(&self, host: &str, strategy: StrategyId) {
        self.push(PolicyEvent::Lock(host.to_string(), strategy));
    }

    fn on_unlock(&self, host: &str) {
        self.push(PolicyEvent::Unlock(host.to_string()));
    }
}
