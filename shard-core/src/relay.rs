//! The relay: consensus change processing and the query façade
//!
//! A [`Relay`] owns the [`HostIndex`], subscribes to a chain engine and folds
//! every [`ConsensusChange`] into the index. Queries read the same index
//! under a shared lock, so they observe each change entirely or not at all.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::announcement::{announcements_in, extract_announcements};
use crate::chain::{ChainError, ChangeId, ConsensusChange, ConsensusSet, ConsensusSubscriber};
use crate::index::{HostIndex, HostMatch};
use crate::metrics::Metrics;
use crate::persist::{PersistError, Persister};
use crate::saver::{join_error, Saver};

/// Delay between the first unsaved change and the save that captures it
pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("chain subscription failed: {0}")]
    Chain(#[from] ChainError),
}

pub struct Relay {
    index: Arc<RwLock<HostIndex>>,
    chain: Arc<dyn ConsensusSet>,
    saver: Saver,
    metrics: Metrics,
}

impl Relay {
    /// Load the saved index and subscribe to `chain` from its cursor
    ///
    /// If the chain rejects the cursor the index is discarded and rebuilt
    /// from genesis. Fails if the snapshot cannot be read or the rescan
    /// subscription fails too.
    pub async fn new(
        chain: Arc<dyn ConsensusSet>,
        persister: Arc<dyn Persister>,
        save_delay: Duration,
        metrics: Metrics,
    ) -> Result<Arc<Self>, RelayError> {
        let loader = persister.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(join_error)?;

        let index = match loaded {
            Ok(data) => {
                info!(
                    height = data.height,
                    hosts = data.hosts.len(),
                    cursor = %data.last_change,
                    "Loaded saved host index"
                );
                HostIndex::from_snapshot(data)
            }
            Err(PersistError::NotFound) => {
                info!("No saved host index, starting from genesis");
                HostIndex::default()
            }
            Err(e) => return Err(e.into()),
        };

        let start = index.last_change();
        let index = Arc::new(RwLock::new(index));
        let saver = Saver::spawn(index.clone(), persister, metrics.clone(), save_delay);
        let relay = Arc::new(Self {
            index,
            chain,
            saver,
            metrics,
        });

        if let Err(e) = relay.chain.subscribe(relay.clone(), start).await {
            warn!(error = %e, cursor = %start, "Subscription rejected, rescanning from genesis");
            relay.reset();
            relay.chain.subscribe(relay.clone(), ChangeId::BEGINNING).await?;
        }

        info!(
            height = relay.height(),
            hosts = relay.host_count(),
            "Relay subscribed to consensus changes"
        );
        Ok(relay)
    }

    pub fn height(&self) -> u64 {
        self.index.read().height()
    }

    /// Whether the chain engine considers itself caught up
    pub fn synced(&self) -> bool {
        self.chain.synced()
    }

    /// Resolve a full key or key prefix
    pub fn lookup(&self, prefix: &str) -> HostMatch {
        let found = self.index.read().lookup(prefix);
        match &found {
            HostMatch::Unique(_) => self.metrics.lookup_hit(),
            HostMatch::NotFound => self.metrics.lookup_missed(),
            HostMatch::Ambiguous(_) => self.metrics.lookup_ambiguous(),
        }
        found
    }

    /// The stored announcement bytes for an exact key
    pub fn host_announcement(&self, key: &str) -> Option<Bytes> {
        self.index.read().announcement(key)
    }

    pub fn host_count(&self) -> usize {
        self.index.read().len()
    }

    pub fn last_change(&self) -> ChangeId {
        self.index.read().last_change()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Prometheus text for the relay's counters and gauges
    pub fn render_metrics(&self) -> String {
        let (height, hosts) = {
            let index = self.index.read();
            (index.height(), index.len())
        };
        self.metrics.to_prometheus(height, hosts)
    }

    /// Completed save count; changes after every successful save
    pub fn saves(&self) -> watch::Receiver<u64> {
        self.saver.completed()
    }

    /// Write a pending save immediately instead of waiting for the delay
    pub async fn flush(&self) -> Result<bool, PersistError> {
        self.saver.flush().await
    }

    /// Drop all indexed state ahead of a rescan from genesis
    ///
    /// The emptied index is queued for saving so the store stops pointing
    /// at a cursor the chain has forgotten.
    fn reset(&self) {
        let mut index = self.index.write();
        index.reset();
        if index.queue_save() {
            self.saver.request();
        }
        self.metrics.resync();
    }
}

impl ConsensusSubscriber for Relay {
    fn process_consensus_change(&self, change: &ConsensusChange) {
        let reverted: Vec<_> = change
            .reverted_blocks
            .iter()
            .flat_map(|block| announcements_in(block, &self.metrics))
            .collect();
        // applied block by block so each overwrite stays revertible
        let applied: Vec<_> = change
            .applied_blocks
            .iter()
            .map(|block| {
                let mut found = HashMap::new();
                extract_announcements(block, &mut found, &self.metrics);
                found
            })
            .collect();
        let announced: usize = applied.iter().map(HashMap::len).sum();

        let (height, retracted, added, hosts) = {
            let mut index = self.index.write();
            let height =
                index.advance_height(change.applied_blocks.len(), change.reverted_blocks.len());

            let mut retracted = 0;
            for (key, announcement) in &reverted {
                if index.retract(key, announcement) {
                    retracted += 1;
                }
            }
            let added: usize = applied
                .into_iter()
                .map(|found| index.apply_announcements(found))
                .sum();
            index.set_last_change(change.id);

            if announced + retracted > 0 && index.queue_save() {
                self.saver.request();
            }
            (height, retracted, added, index.len())
        };

        self.metrics.change_processed(
            change.applied_blocks.len(),
            change.reverted_blocks.len(),
            announced,
            retracted,
        );
        debug!(
            change = %change.id,
            height,
            applied = change.applied_blocks.len(),
            reverted = change.reverted_blocks.len(),
            announced,
            retracted,
            "Processed consensus change"
        );
        if added > 0 {
            info!(added, hosts, height, "Indexed new hosts");
        }
    }

    fn reset_subscription(&self) {
        warn!(
            height = self.height(),
            cursor = %self.last_change(),
            "Chain lost our cursor, rebuilding host index from genesis"
        );
        self.reset();
    }
}
