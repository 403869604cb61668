//! Fire-and-forget notification to the counterpart user
//!
//! Delivery is an external collaborator; the ledger only publishes events.
//! A failing notifier must never fail the operation that produced the
//! event, so the service logs and drops delivery errors.

/// One message addressed to a user, published after a successful state
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub sender: String,
    pub receiver: String,
    pub message: String,
}

pub trait Notify: Send + Sync {
    fn notify(&self, event: &NotifyEvent) -> anyhow::Result<()>;
}

/// Default sink: writes the event to the log and calls it delivered.
pub struct LogNotifier;

impl Notify for LogNotifier {
    fn notify(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        log::info!(
            "notify {} -> {}: {}",
            event.sender,
            event.receiver,
            event.message
        );
        Ok(())
    }
}
