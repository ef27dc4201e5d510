//! Automation callbacks fired by the send pipeline
//!
//! Three fixed slots, registered once at startup:
//!
//! | Slot | Argument | Fires |
//! |------|----------|-------|
//! | `on_sent` | latency in seconds | every resolved send |
//! | `on_send_success` | - | delivered sends |
//! | `on_send_failure` | - | failed or timed out sends |
//!
//! Empty slots are no-ops.

use std::fmt;
use std::sync::Arc;

/// Callback receiving the send latency in seconds
pub type SentCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Callback without arguments
pub type OutcomeCallback = Arc<dyn Fn() + Send + Sync>;

/// Typed callback slots for send outcomes
#[derive(Clone, Default)]
pub struct SendHooks {
    on_sent: Option<SentCallback>,
    on_success: Option<OutcomeCallback>,
    on_failure: Option<OutcomeCallback>,
}

impl SendHooks {
    /// No callbacks registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the on-sent callback
    pub fn on_sent(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_sent = Some(Arc::new(f));
        self
    }

    /// Register the on-send-success callback
    pub fn on_send_success(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Register the on-send-failure callback
    pub fn on_send_failure(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Fire the hooks for one resolved send, on-sent first
    pub(crate) fn fire(&self, latency_secs: f32, success: bool) {
        if let Some(f) = &self.on_sent {
            f(latency_secs);
        }
        let outcome = if success {
            &self.on_success
        } else {
            &self.on_failure
        };
        if let Some(f) = outcome {
            f();
        }
    }
}

impl fmt::Debug for SendHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendHooks")
            .field("on_sent", &self.on_sent.is_some())
            .field("on_send_success", &self.on_success.is_some())
            .field("on_send_failure", &self.on_failure.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_fire_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let hooks = SendHooks::new()
            .on_sent(move |latency| a.lock().push(format!("sent {:.2}", latency)))
            .on_send_success(move || b.lock().push("success".to_string()))
            .on_send_failure(move || c.lock().push("failure".to_string()));

        hooks.fire(0.04, true);
        hooks.fire(1.0, false);
        assert_eq!(
            *log.lock(),
            vec!["sent 0.04", "success", "sent 1.00", "failure"]
        );
    }

    #[test]
    fn test_empty_hooks_are_noops() {
        let hooks = SendHooks::new();
        hooks.fire(0.1, true);
        hooks.fire(0.1, false);
        assert!(format!("{:?}", hooks).contains("on_sent: false"));
    }
}
