use chrono::{DateTime, Utc};
use std::fmt;

/*
 * What the engine believes the remote API holds for one object. A record
 * exists only after a successful push and goes away with a successful
 * delete.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRecord {
    pub fingerprint: String,
    pub tenant: String,

    // when the content was last accepted by the remote API
    pub last_synced: DateTime<Utc>,
}

impl ReconciliationRecord {

    pub fn new(fingerprint: &str, tenant: &str) -> Self {
	Self{
	    fingerprint: fingerprint.to_string(),
	    tenant: tenant.to_string(),
	    last_synced: Utc::now(),
	}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /*
     * 4xx from the remote API, retrying the same request won't help
     */
    Rejected { status: u16 },

    /*
     * 5xx, timeout or transport error which persisted across every attempt
     */
    Unavailable { attempts: u32, reason: String },
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    SyncFailure::Rejected{ status } => write!(f, "rejected with status {}", status),
	    SyncFailure::Unavailable{ attempts, reason } => write!(f, "unavailable after {} attempt(s): {}", attempts, reason),
	}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,

    /* nothing had to change remotely (e.g. delete of an absent object) */
    NoOp,

    Failed(SyncFailure),
}

impl SyncOutcome {

    pub fn is_success(&self) -> bool {
	!matches!(self, SyncOutcome::Failed(_))
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    SyncOutcome::Applied => write!(f, "applied"),
	    SyncOutcome::NoOp => write!(f, "no-op"),
	    SyncOutcome::Failed(failure) => write!(f, "failed: {}", failure),
	}
    }
}
