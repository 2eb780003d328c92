//! Persistence collaborator
//!
//! A key-value mapping from message id to stored envelope, with a scan
//! that yields a channel's messages in replay order.

use std::collections::{BTreeMap, HashMap};

use lao_core::{Channel, MessageId, Timestamp};
use lao_crypto::SignedEnvelope;
use lao_wire::DataRole;

/// Replay order: `(lastModifiedAt, phase, message id)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplayKey {
    pub at: Timestamp,
    pub phase: DataRole,
    pub id: MessageId,
}

impl ReplayKey {
    /// Witnesses carry no time of their own and replay last
    pub fn new(at: Option<Timestamp>, phase: DataRole, id: MessageId) -> Self {
        ReplayKey {
            at: at.unwrap_or(Timestamp::MAX),
            phase,
            id,
        }
    }
}

/// Envelope as persisted, with the channel it was received on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub channel: Channel,
    pub envelope: SignedEnvelope,
    pub key: ReplayKey,
}

pub trait MessageStore: Send {
    fn get(&self, id: &MessageId) -> Option<StoredMessage>;

    /// Insert or replace the message stored under `id`
    fn put(&mut self, id: MessageId, message: StoredMessage);

    /// Messages on `channel` and its sub-channels, in replay order
    fn scan(&self, channel: &Channel) -> Vec<StoredMessage>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    ordered: BTreeMap<ReplayKey, StoredMessage>,
    keys: HashMap<MessageId, ReplayKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn get(&self, id: &MessageId) -> Option<StoredMessage> {
        self.keys.get(id).and_then(|k| self.ordered.get(k)).cloned()
    }

    fn put(&mut self, id: MessageId, message: StoredMessage) {
        if let Some(old) = self.keys.insert(id, message.key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(message.key, message);
    }

    fn scan(&self, channel: &Channel) -> Vec<StoredMessage> {
        self.ordered
            .values()
            .filter(|m| m.channel.is_sub_channel_of(channel))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}
