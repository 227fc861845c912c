//! The unit of transport.

use crate::messages::Message;
use crate::policy::IoPolicy;
use crate::topic::Topic;
use std::time::Duration;

/// Ordering attributes of an ordered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderInfo {
    /// Per (topic, sender) sequence number, starting at 1
    pub sequence: u64,
    /// How long a gap may block delivery; zero means the network default
    pub timeout: Duration,
    /// Drop a gap instead of waiting forever once the timeout elapses
    pub skip_on_timeout: bool,
}

/// A message addressed to a topic and processed by a policy pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub policy: IoPolicy,
    pub topic: Topic,
    pub order: Option<OrderInfo>,
    pub message: Message,
}

impl Envelope {
    pub fn new(policy: IoPolicy, topic: Topic, message: Message) -> Self {
        Self {
            policy,
            topic,
            order: None,
            message,
        }
    }

    pub fn ordered(
        policy: IoPolicy,
        topic: Topic,
        message: Message,
        sequence: u64,
        timeout: Duration,
        skip_on_timeout: bool,
    ) -> Self {
        Self {
            policy,
            topic,
            order: Some(OrderInfo {
                sequence,
                timeout,
                skip_on_timeout,
            }),
            message,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.order.is_some()
    }

    /// Wire sequence number, -1 when unordered
    pub fn wire_sequence(&self) -> i64 {
        self.order.map_or(-1, |o| o.sequence as i64)
    }

    /// Copy for one additional destination of a multi-node send.
    pub fn copy_for_fan_out(&self) -> Self {
        Self {
            policy: self.policy,
            topic: self.topic.clone(),
            order: self.order,
            message: self.message.copy_for_fan_out(),
        }
    }
}
