//! Leader Election Module
//!
//! Per-base election records and the state machine driving them.

mod manager;
mod record;

pub use manager::{ElectionManager, RoleSnapshot, SmudgeMode};
pub use record::{BaseId, ElectionRecord, ElectionState, ElectionStatus, Generation, PeerId};
