//! Background Maintenance
//!
//! The stale-session sweep runs detached from the request that triggered
//! it. Its errors are logged and never reach the caller.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::env;
use crate::ledger::{CheckoutLedger, DEFAULT_STALE_SESSION_HOURS};

/// Sweep configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Pending sessions older than this many hours become `abandoned`
    pub stale_session_hours: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stale_session_hours: DEFAULT_STALE_SESSION_HOURS,
        }
    }
}

impl MaintenanceConfig {
    pub fn from_env() -> Self {
        Self::from_hours(env::parse("STALE_SESSION_HOURS"))
    }

    /// Clamp to at least one hour; `None` keeps the default.
    pub fn from_hours(hours: Option<i64>) -> Self {
        Self {
            stale_session_hours: hours.map_or(DEFAULT_STALE_SESSION_HOURS, |h| h.max(1)),
        }
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_session_hours)
    }
}

/// Mark stale pending sessions as abandoned on a detached task.
pub fn spawn_stale_sweep(ledger: Arc<dyn CheckoutLedger>, older_than: chrono::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        match ledger.mark_stale_checkout_sessions(older_than).await {
            Ok(0) => {}
            Ok(changed) => tracing::info!(changed, "webhook.stale_sessions_abandoned"),
            Err(e) => tracing::warn!(error = %e, "webhook.mark_stale_failed"),
        }
    })
}
