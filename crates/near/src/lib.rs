//! Near cache support for atomic (non-transactional) updates
//!
//! Updates are sent to the primary of each key, which assigns the version,
//! writes, replicates to backups and answers with the authoritative values.
//! The [`NearReconciler`] applies those answers to the near store and keeps
//! a bounded history of deletes so stale tombstones are eventually purged.

mod atomic;
mod buffer;
mod config;
mod error;
mod reconciler;

pub use atomic::{AtomicOutcome, AtomicUpdateFuture, NearAtomicCache};
pub use buffer::CircularBuffer;
pub use config::NearConfig;
pub use error::{NearError, Result};
pub use reconciler::NearReconciler;
