use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One assembled transaction queued for the next train departure.
///
/// The result notifier for synchronous callers is NOT carried here; it lives
/// in the coordinator's in-process sink table, keyed by `handle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub handle: Uuid,
    pub raw_tx: Vec<u8>,
    pub outpoint_used: String,
}

/// Terminal outcome delivered to a synchronous caller's sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub txid: Option<String>,
    pub aggregator_status: String,
    pub error: Option<String>,
}

impl ResultMessage {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-transaction verdict returned by the external broadcast aggregator.
///
/// `status` is an opaque string; the scheduler owns the mapping from status
/// strings to request/output dispositions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorVerdict {
    pub txid: String,
    pub status: String,
    #[serde(default)]
    pub extra_info: Option<String>,
}
