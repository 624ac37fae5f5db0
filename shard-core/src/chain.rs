//! Consensus boundary: blocks, consensus changes and the chain engine traits
//!
//! The relay never validates blocks itself. It consumes ordered
//! [`ConsensusChange`] batches from a [`ConsensusSet`], which is either the
//! in-process [`MemoryChain`] or an upstream node followed over HTTP
//! (see [`crate::follower::HttpChain`]).

use async_trait::async_trait;
use hex::FromHex;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("consensus change {0} is not known to the chain")]
    UnknownChange(ChangeId),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },
}

/// Identifier of a consensus change, used as the subscription cursor
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeId([u8; 32]);

impl ChangeId {
    /// Cursor meaning "deliver everything from the genesis block on"
    pub const BEGINNING: ChangeId = ChangeId([0; 32]);

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_beginning(&self) -> bool {
        *self == Self::BEGINNING
    }

    /// Derive the identifier of the change that follows `self`
    pub fn next(&self, sequence: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(&sequence.to_le_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeId({})", self)
    }
}

impl FromStr for ChangeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 32]>::from_hex(s).map(Self)
    }
}

impl Serialize for ChangeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A transaction, reduced to the opaque arbitrary data it carries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default, with = "crate::b64::blob_list")]
    pub arbitrary_data: Vec<Vec<u8>>,
}

impl Transaction {
    pub fn new(arbitrary_data: Vec<Vec<u8>>) -> Self {
        Self { arbitrary_data }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }
}

/// One batch of chain movement, delivered in order by the chain engine
///
/// Reverted blocks are undone before applied blocks are added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusChange {
    pub id: ChangeId,
    #[serde(default)]
    pub applied_blocks: Vec<Block>,
    #[serde(default)]
    pub reverted_blocks: Vec<Block>,
}

/// Receives consensus changes from a [`ConsensusSet`]
pub trait ConsensusSubscriber: Send + Sync {
    fn process_consensus_change(&self, change: &ConsensusChange);

    /// The engine lost the subscriber's cursor and will deliver again from
    /// genesis; state built from earlier changes must be dropped first.
    fn reset_subscription(&self) {}
}

/// A chain engine that delivers consensus changes to subscribers
#[async_trait]
pub trait ConsensusSet: Send + Sync {
    /// Subscribe starting after `start`, first replaying every change the
    /// subscriber has not seen yet, then delivering new ones as they arrive.
    ///
    /// Fails with [`ChainError::UnknownChange`] when `start` is not part of the
    /// chain's history.
    async fn subscribe(
        &self,
        subscriber: Arc<dyn ConsensusSubscriber>,
        start: ChangeId,
    ) -> Result<(), ChainError>;

    /// Whether the engine believes it has caught up with the network
    fn synced(&self) -> bool;
}

/// In-process chain engine holding the full change log in memory
pub struct MemoryChain {
    inner: Mutex<MemoryChainInner>,
    synced: AtomicBool,
}

struct MemoryChainInner {
    changes: Vec<ConsensusChange>,
    subscribers: Vec<Arc<dyn ConsensusSubscriber>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryChainInner {
                changes: Vec::new(),
                subscribers: Vec::new(),
            }),
            synced: AtomicBool::new(true),
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Relaxed);
    }

    /// Append a change to the log and deliver it to every subscriber
    pub fn push(&self, change: ConsensusChange) {
        let mut inner = self.inner.lock();
        for subscriber in &inner.subscribers {
            subscriber.process_consensus_change(&change);
        }
        inner.changes.push(change);
    }

    /// Append a change built from the given blocks, returning its id
    pub fn push_blocks(&self, applied_blocks: Vec<Block>, reverted_blocks: Vec<Block>) -> ChangeId {
        let id = {
            let inner = self.inner.lock();
            let parent = inner.changes.last().map(|c| c.id).unwrap_or(ChangeId::BEGINNING);
            parent.next(inner.changes.len() as u64)
        };
        self.push(ConsensusChange {
            id,
            applied_blocks,
            reverted_blocks,
        });
        id
    }

    /// Up to `limit` changes following `after`
    pub fn changes_after(
        &self,
        after: ChangeId,
        limit: usize,
    ) -> Result<Vec<ConsensusChange>, ChainError> {
        let inner = self.inner.lock();
        let start = inner.position_after(after)?;
        Ok(inner.changes[start..].iter().take(limit).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attach(
        &self,
        subscriber: Arc<dyn ConsensusSubscriber>,
        start: ChangeId,
    ) -> Result<(), ChainError> {
        let mut inner = self.inner.lock();
        let position = inner.position_after(start)?;
        debug!(
            cursor = %start,
            backlog = inner.changes.len() - position,
            "Subscriber attached to memory chain"
        );
        for change in &inner.changes[position..] {
            subscriber.process_consensus_change(change);
        }
        inner.subscribers.push(subscriber);
        Ok(())
    }
}

impl MemoryChainInner {
    fn position_after(&self, cursor: ChangeId) -> Result<usize, ChainError> {
        if cursor.is_beginning() {
            return Ok(0);
        }
        self.changes
            .iter()
            .position(|c| c.id == cursor)
            .map(|i| i + 1)
            .ok_or(ChainError::UnknownChange(cursor))
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsensusSet for MemoryChain {
    async fn subscribe(
        &self,
        subscriber: Arc<dyn ConsensusSubscriber>,
        start: ChangeId,
    ) -> Result<(), ChainError> {
        self.attach(subscriber, start)
    }

    fn synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }
}
