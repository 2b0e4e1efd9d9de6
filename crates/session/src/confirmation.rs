use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

/// A resolved `user.response` to a pending `agent.user_confirm`.
#[derive(Debug, Clone)]
pub struct ConfirmationResponse {
    pub confirmed: bool,
    /// Present only for plan-confirmation responses that override the
    /// task list.
    pub tasks: Option<Value>,
}

/// Why a pending confirmation resolved without an explicit answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    TimedOut,
    Cancelled,
}

/// Tracks the single confirmation a Session may have outstanding at a
/// time, keyed by `step_id`. One Session never has more than one
/// pending entry because `run` blocks on it before continuing.
pub struct ConfirmationGate {
    pending: Mutex<HashMap<String, oneshot::Sender<ConfirmationResponse>>>,
    timeout: Duration,
}

impl ConfirmationGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a new pending confirmation and return a receiver that
    /// resolves on `respond`, on cancellation, or after the configured
    /// timeout.
    pub fn wait(&self, step_id: String) -> oneshot::Receiver<ConfirmationResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(step_id, tx);
        rx
    }

    /// Resolve a pending confirmation by `step_id`. Returns `true` if a
    /// matching entry was found and still pending.
    pub fn respond(&self, step_id: &str, response: ConfirmationResponse) -> bool {
        if let Some(tx) = self.pending.lock().remove(step_id) {
            let _ = tx.send(response);
            return true;
        }
        false
    }

    /// Drop a pending entry without resolving it (the receiver then
    /// observes a closed channel, which the Session treats as
    /// cancellation).
    pub fn cancel(&self, step_id: &str) {
        self.pending.lock().remove(step_id);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_resolves_the_waiter() {
        let gate = ConfirmationGate::new(Duration::from_secs(300));
        let rx = gate.wait("confirm_1_delete_all".into());
        assert!(gate.respond(
                "confirm_1_delete_all",
                ConfirmationResponse {
                    confirmed: true,
                    tasks: None
                }
        ));
        let resp = rx.await.unwrap();
        assert!(resp.confirmed);
    }

    #[tokio::test]
    async fn cancel_closes_channel_without_a_response() {
        let gate = ConfirmationGate::new(Duration::from_secs(300));
        let rx = gate.wait("confirm_1_x".into());
        gate.cancel("confirm_1_x");
        assert!(rx.await.is_err());
    }

    #[test]
    fn respond_to_unknown_step_id_returns_false() {
        let gate = ConfirmationGate::new(Duration::from_secs(300));
        assert!(!gate.respond(
                "nope",
                ConfirmationResponse {
                    confirmed: false,
                    tasks: None
                }
        ));
    }
}
