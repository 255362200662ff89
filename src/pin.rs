use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::remote::{with_timeout, RemoteStore};

/// Soft check that a location's access code was not rotated mid-checklist.
///
/// Never blocks a submission because of its own failure: any error while asking
/// the remote store counts as "still valid".
#[derive(Clone)]
pub struct PinFreshnessGuard {
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl PinFreshnessGuard {
    pub fn new(remote: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    #[instrument(skip_all, fields(location_id = %location_id))]
    pub async fn check_invalid(&self, location_id: &str, session_start: DateTime<Utc>) -> bool {
        let call = self.remote.check_pin_invalidated(location_id, session_start);
        match with_timeout(self.timeout, call).await {
            Ok(invalid) => invalid,
            Err(err) => {
                warn!(%err, "pin freshness check failed; treating code as valid");
                false
            }
        }
    }
}
