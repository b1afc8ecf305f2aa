//! Adapter availability.

use std::time::Duration;

use tokio::sync::watch;

/// Radio state as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    /// Powered on and usable.
    Available,
    /// Off, missing, or denied.
    Unavailable,
    /// Powering up or down, or not yet known.
    Transitioning,
}

impl AdapterState {
    /// Whether the state is final enough to act on.
    pub fn is_settled(self) -> bool {
        self != Self::Transitioning
    }
}

/// Wait up to `bound` for the adapter to leave [`AdapterState::Transitioning`].
///
/// Returns `None` when the bound elapses. A backend that drops its state
/// sender is reported as [`AdapterState::Unavailable`].
pub async fn wait_settled(
    mut state: watch::Receiver<AdapterState>,
    bound: Duration,
) -> Option<AdapterState> {
    match tokio::time::timeout(bound, state.wait_for(|s| s.is_settled())).await {
        Ok(Ok(settled)) => Some(*settled),
        Ok(Err(_)) => Some(AdapterState::Unavailable),
        Err(_) => None,
    }
}
