//! Persistence of finished runs.

mod record;

pub use record::{RunRecord, RunRecordStore, RECORD_VERSION};
