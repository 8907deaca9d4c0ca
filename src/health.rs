//! Readiness boundary toward the service orchestrator.

/// Named readiness check for the command connection.
pub const COMMANDS_CHECK: &str = "redis-pub";

/// Named readiness check for the expiry-notification connection.
pub const NOTIFICATIONS_CHECK: &str = "redis-sub";

/// Liveness signals consumed by an external readiness/shutdown coordinator.
///
/// The store's two connections report under distinct named checks
/// ([`COMMANDS_CHECK`], [`NOTIFICATIONS_CHECK`]) so a partial outage —
/// command path up, notification path down — is externally observable.
pub trait ServiceState: Send + Sync + 'static {
    fn signal_ready(&self, check: &str);
    fn signal_not_ready(&self, check: &str);
}

/// No-op coordinator for consumers that wire readiness elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullServiceState;

impl ServiceState for NullServiceState {
    fn signal_ready(&self, _check: &str) {}
    fn signal_not_ready(&self, _check: &str) {}
}
