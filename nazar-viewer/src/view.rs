use nazar_proto::MetricRecord;

use crate::{aggregate::latest_per_host, buffer::RollingBuffer};

/// How many records the activity log shows.
pub const RECENT_ACTIVITY_LEN: usize = 10;

/// Status text shown while the session waits to reconnect.
pub const CONNECTION_LOST: &str = "Connection lost. Reconnecting...";

/// Everything a renderer may depend on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewModel {
    pub records: RollingBuffer,
    pub connected: bool,
    pub error: Option<String>,
}

impl ViewModel {
    /// One record per host, most recently updated host first.
    pub fn hosts(&self) -> Vec<&MetricRecord> {
        latest_per_host(self.records.iter())
    }

    pub fn recent_activity(&self) -> impl Iterator<Item = &MetricRecord> {
        self.records.iter().take(RECENT_ACTIVITY_LEN)
    }

    pub(crate) fn set_connected(&mut self) {
        self.connected = true;
        self.error = None;
    }

    pub(crate) fn set_disconnected(&mut self) {
        self.connected = false;
        self.error = Some(CONNECTION_LOST.to_owned());
    }
}
