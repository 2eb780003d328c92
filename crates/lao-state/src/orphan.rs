//! Orphan witness buffer
//!
//! Witness messages may overtake the modification they attest. They are
//! parked here per channel until the target shows up, the horizon passes,
//! or the channel overflows and the oldest entry is evicted.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use lao_core::{Channel, MessageId, PublicKey, Signature};

/// Buffered witness signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrphanWitness {
    pub target: MessageId,
    pub witness: PublicKey,
    pub signature: Signature,
    pub received_at: Instant,
}

#[derive(Debug)]
pub struct OrphanBuffer {
    horizon: Duration,
    max_per_channel: usize,
    channels: HashMap<Channel, VecDeque<OrphanWitness>>,
}

impl OrphanBuffer {
    pub fn new(horizon: Duration, max_per_channel: usize) -> Self {
        OrphanBuffer {
            horizon,
            max_per_channel: max_per_channel.max(1),
            channels: HashMap::new(),
        }
    }

    /// Park a witness signature. Returns the entry evicted to make room,
    /// if any. The same `(target, witness)` pair is kept once.
    pub fn insert(&mut self, channel: &Channel, orphan: OrphanWitness) -> Option<OrphanWitness> {
        self.prune(orphan.received_at);

        let queue = self.channels.entry(channel.clone()).or_default();
        if queue
            .iter()
            .any(|o| o.target == orphan.target && o.witness == orphan.witness)
        {
            return None;
        }

        let evicted = if queue.len() >= self.max_per_channel {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(orphan);
        evicted
    }

    /// Remove and return the witnesses waiting for `target`.
    ///
    /// Searches every channel on the same branch as `channel`, above or
    /// below it, so a witness published on the organization channel or on
    /// a deeper sub-channel still finds its target.
    pub fn take(&mut self, channel: &Channel, target: &MessageId, now: Instant) -> Vec<OrphanWitness> {
        self.prune(now);

        let mut found = Vec::new();
        for (buffered, queue) in self.channels.iter_mut() {
            if !channel.is_sub_channel_of(buffered) && !buffered.is_sub_channel_of(channel) {
                continue;
            }
            let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|o| o.target == *target);
            *queue = rest;
            found.extend(matching);
        }
        self.channels.retain(|_, q| !q.is_empty());
        found
    }

    /// Drop entries older than the horizon; returns how many went
    pub fn prune(&mut self, now: Instant) -> usize {
        let horizon = self.horizon;
        let mut dropped = 0;
        for (channel, queue) in self.channels.iter_mut() {
            let before = queue.len();
            queue.retain(|o| now.saturating_duration_since(o.received_at) <= horizon);
            let expired = before - queue.len();
            if expired > 0 {
                tracing::debug!(%channel, expired, "Dropped expired orphan witnesses");
            }
            dropped += expired;
        }
        self.channels.retain(|_, q| !q.is_empty());
        dropped
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
