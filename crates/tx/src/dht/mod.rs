//! Participant side of the transaction protocol: requests served by primary
//! and backup owners of the keys.

mod lock_table;
mod participant;

pub use lock_table::{LockResult, LockTable};
pub use participant::TxParticipant;
