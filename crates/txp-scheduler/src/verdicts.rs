//! Mapping from opaque aggregator status strings to request/output
//! dispositions.
//!
//! One mapping for every code path. The canonical success set is everything
//! the aggregator reports once a transaction is in its custody; `mined` is a
//! refinement of success; `double-spend` fails the request but the output is
//! committed as spent, because an aggregator that reports a double-spend
//! believes the outpoint was consumed on-chain — handing it back to the pool
//! would produce guaranteed-invalid transactions.

use txp_store::RequestStatus;

/// What happens to the held output after a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAction {
    /// `held → spent`.
    Commit,
    /// `held → available`.
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub request_status: RequestStatus,
    pub output_action: OutputAction,
    /// Failure reason recorded on the request, when any.
    pub error: Option<String>,
}

const SUCCESS_STATUSES: &[&str] = &[
    "accepted",
    "seen-on-network",
    "announced",
    "sent",
    "stored",
    "received",
];

/// Classify one per-item verdict status.
pub fn classify(status: &str) -> Disposition {
    if SUCCESS_STATUSES.contains(&status) {
        return Disposition {
            request_status: RequestStatus::Success,
            output_action: OutputAction::Commit,
            error: None,
        };
    }

    match status {
        "mined" => Disposition {
            request_status: RequestStatus::Mined,
            output_action: OutputAction::Commit,
            error: None,
        },
        "double-spend" => Disposition {
            request_status: RequestStatus::Failed,
            output_action: OutputAction::Commit,
            error: Some("double-spend".to_string()),
        },
        "rejected" => Disposition {
            request_status: RequestStatus::Failed,
            output_action: OutputAction::Release,
            error: Some("rejected by aggregator".to_string()),
        },
        other => Disposition {
            request_status: RequestStatus::Failed,
            output_action: OutputAction::Release,
            error: Some(format!("unexpected aggregator status: {other}")),
        },
    }
}
