//! Transport SPI.
//!
//! The substrate hands remote envelopes to a [`Transport`] and receives
//! inbound ones through [`InboundHandler`]. Socket I/O and framing live
//! behind these traits.

use crate::TransportError;
use gridcore_common::{ClusterNode, NodeId};
use gridcore_protocol::Envelope;

pub trait Transport: Send + Sync {
    /// Send one envelope; failures are surfaced, never dropped silently.
    fn send_message(&self, node: &ClusterNode, envelope: Envelope) -> Result<(), TransportError>;
}

pub trait InboundHandler: Send + Sync {
    /// Called on the transport's receive path for every decoded envelope.
    fn on_envelope(&self, sender: NodeId, envelope: Envelope);
}
