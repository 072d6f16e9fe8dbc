//! Counting gate used to drain sessions on shutdown.

use tokio::sync::watch;
use tracing::debug;

/// Tracks the number of active sessions.
///
/// The gate is closed while at least one session is active and open when
/// none are. `wait_idle` blocks until the gate is open, which lets shutdown
/// stop new work first and wait for in-flight sessions second.
#[derive(Debug)]
pub struct ShutdownGate {
    active: watch::Sender<usize>,
}

impl ShutdownGate {
    /// Creates an open gate with no active sessions.
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self { active }
    }

    /// Records a new active session; closes the gate on 0 → 1.
    pub fn session_started(&self) {
        self.active.send_modify(|count| {
            *count += 1;
            if *count == 1 {
                debug!("shutdown gate closed");
            }
        });
    }

    /// Records a finished session; opens the gate on 1 → 0.
    pub fn session_ended(&self) {
        self.active.send_modify(|count| {
            *count = count.saturating_sub(1);
            if *count == 0 {
                debug!("shutdown gate open");
            }
        });
    }

    /// Returns the number of active sessions.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Waits until no session is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}
