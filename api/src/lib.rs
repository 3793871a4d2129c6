/*
 * cortexsync/api - defines the objects shared by every part of the
 * cortexsync engine: watched objects, tenants, payloads and sync records.
 */

pub mod object;
pub use object::ObjectKey;
pub use object::FieldValue;
pub use object::WatchedObject;
pub use object::MissingMetadata;

pub mod payload;
pub use payload::FunctionKind;
pub use payload::NormalizedPayload;
pub use payload::TenantContext;
pub use payload::TenantSource;

pub mod record;
pub use record::ReconciliationRecord;
pub use record::SyncFailure;
pub use record::SyncOutcome;
