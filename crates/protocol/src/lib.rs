//! Wire protocol for inter-node communication
//!
//! This crate defines the envelope every message travels in (policy, topic,
//! optional ordering), the typed message sum type exchanged by the
//! transaction and atomic update protocols, and a resumable envelope codec
//! for non-blocking transports.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod policy;
pub mod topic;

pub use codec::{EnvelopeReader, EnvelopeWriter, decode_from_slice, encode_to_vec};
pub use envelope::{Envelope, OrderInfo};
pub use error::{CodecError, Result};
pub use messages::{
    AtomicOp, Concurrency, DhtAtomicUpdateRequest, EntryOp, FinishRequest, FinishResponse,
    LockRequest, LockResponse, Message, MessageKind, NearAtomicUpdateRequest,
    NearAtomicUpdateResponse, OwnedValue, PrepareRequest, PrepareResponse, RemoteError,
    TxContext, TxEntry, UserMessage,
};
pub use policy::IoPolicy;
pub use topic::Topic;
