//! Device capabilities the pipeline observes: connectivity and battery.

use async_trait::async_trait;
use tokio::sync::watch;

/// Source of network connectivity state.
pub trait ConnectivitySource: Send + Sync {
    /// Whether the device is currently online.
    fn is_online(&self) -> bool;

    /// Subscribe to connectivity changes.
    ///
    /// The receiver yields the new state on every transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Source of battery level readings.
#[async_trait]
pub trait BatteryMonitor: Send + Sync {
    /// Current charge in percent, or `None` when the level is unknown.
    async fn level(&self) -> Option<u8>;
}

/// Whether `level` puts the device in low-battery mode.
///
/// An unknown level never does.
#[must_use]
pub fn is_low_battery(level: Option<u8>, threshold_percent: u8) -> bool {
    level.is_some_and(|pct| pct < threshold_percent)
}
