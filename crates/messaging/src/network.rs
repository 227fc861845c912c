//! In-process network connecting substrates of one process.
//!
//! Every envelope is encoded with the resumable codec, pushed through the
//! reader in small chunks and decoded on the receiving side, so the wire
//! format is exercised exactly as a socket transport would use it.

use crate::TransportError;
use crate::transport::{InboundHandler, Transport};
use gridcore_common::{ClusterNode, NodeId};
use gridcore_protocol::{Envelope, EnvelopeReader, EnvelopeWriter};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Bytes moved per write/read step
const DEFAULT_CHUNK: usize = 61;

pub struct LocalNetwork {
    endpoints: RwLock<HashMap<NodeId, Arc<dyn InboundHandler>>>,
    /// Nodes whose traffic is silently lost in both directions
    blocked: RwLock<HashSet<NodeId>>,
    chunk: usize,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_chunk_size(DEFAULT_CHUNK)
    }

    pub fn with_chunk_size(chunk: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            chunk: chunk.max(1),
        })
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn InboundHandler>) {
        self.endpoints.write().insert(node, handler);
    }

    pub fn unregister(&self, node: NodeId) {
        self.endpoints.write().remove(&node);
    }

    /// Transport used by `local` to reach its peers
    pub fn transport(self: &Arc<Self>, local: NodeId) -> Arc<dyn Transport> {
        Arc::new(NetworkTransport {
            local,
            network: self.clone(),
        })
    }

    /// Simulate a hung node: its traffic is lost without errors.
    pub fn block(&self, node: NodeId) {
        self.blocked.write().insert(node);
    }

    pub fn unblock(&self, node: NodeId) {
        self.blocked.write().remove(&node);
    }

    fn is_blocked(&self, from: NodeId, to: NodeId) -> bool {
        let blocked = self.blocked.read();
        blocked.contains(&from) || blocked.contains(&to)
    }

    fn deliver(&self, from: NodeId, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_blocked(from, to) {
            tracing::trace!(from = %from, to = %to, "dropping envelope on blocked link");
            return Ok(());
        }

        let handler = self
            .endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))?;

        let mut writer = EnvelopeWriter::new(&envelope)?;
        let mut reader = EnvelopeReader::new();
        let mut buf = vec![0u8; self.chunk];

        while !writer.is_done() {
            let n = writer.write_to(&mut buf);
            let mut pos = 0;
            while pos < n {
                let (consumed, decoded) = reader.read_from(&buf[pos..n]);
                pos += consumed;
                match decoded {
                    Some(Ok(envelope)) => handler.on_envelope(from, envelope),
                    Some(Err(e)) => {
                        tracing::error!(from = %from, to = %to, "failed to decode envelope (will drop): {}", e);
                    }
                    None => {}
                }
            }
        }

        Ok(())
    }
}

struct NetworkTransport {
    local: NodeId,
    network: Arc<LocalNetwork>,
}

impl Transport for NetworkTransport {
    fn send_message(&self, node: &ClusterNode, envelope: Envelope) -> Result<(), TransportError> {
        self.network.deliver(self.local, node.id, envelope)
    }
}
