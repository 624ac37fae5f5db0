//! Prometheus metrics for the relay
//!
//! Thread-safe counters using atomic types

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::announcement::AnnouncementError;

/// Metrics collector shared by the processor, the save worker and the API
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Consensus processing
    changes_processed: AtomicU64,
    blocks_applied: AtomicU64,
    blocks_reverted: AtomicU64,
    announcements_applied: AtomicU64,
    announcements_retracted: AtomicU64,
    resyncs: AtomicU64,

    // Discarded arbitrary data, by reason
    discarded_malformed: AtomicU64,
    discarded_foreign: AtomicU64,
    discarded_unverified: AtomicU64,

    // Persistence
    saves_completed: AtomicU64,
    saves_failed: AtomicU64,

    // Queries
    lookup_hits: AtomicU64,
    lookup_misses: AtomicU64,
    lookup_ambiguous: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                changes_processed: AtomicU64::new(0),
                blocks_applied: AtomicU64::new(0),
                blocks_reverted: AtomicU64::new(0),
                announcements_applied: AtomicU64::new(0),
                announcements_retracted: AtomicU64::new(0),
                resyncs: AtomicU64::new(0),
                discarded_malformed: AtomicU64::new(0),
                discarded_foreign: AtomicU64::new(0),
                discarded_unverified: AtomicU64::new(0),
                saves_completed: AtomicU64::new(0),
                saves_failed: AtomicU64::new(0),
                lookup_hits: AtomicU64::new(0),
                lookup_misses: AtomicU64::new(0),
                lookup_ambiguous: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Consensus processing

    pub fn change_processed(&self, applied: usize, reverted: usize, announced: usize, retracted: usize) {
        let inner = &self.inner;
        inner.changes_processed.fetch_add(1, Ordering::Relaxed);
        inner.blocks_applied.fetch_add(applied as u64, Ordering::Relaxed);
        inner.blocks_reverted.fetch_add(reverted as u64, Ordering::Relaxed);
        inner.announcements_applied.fetch_add(announced as u64, Ordering::Relaxed);
        inner.announcements_retracted.fetch_add(retracted as u64, Ordering::Relaxed);
    }

    pub fn changes_processed(&self) -> u64 {
        self.inner.changes_processed.load(Ordering::Relaxed)
    }

    pub fn announcements_applied(&self) -> u64 {
        self.inner.announcements_applied.load(Ordering::Relaxed)
    }

    pub fn announcements_retracted(&self) -> u64 {
        self.inner.announcements_retracted.load(Ordering::Relaxed)
    }

    /// The index was dropped to rebuild it from genesis
    pub fn resync(&self) {
        self.inner.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resyncs(&self) -> u64 {
        self.inner.resyncs.load(Ordering::Relaxed)
    }

    pub fn payload_discarded(&self, reason: &AnnouncementError) {
        let counter = match reason {
            AnnouncementError::Malformed(_) => &self.inner.discarded_malformed,
            AnnouncementError::NotAnnouncement => &self.inner.discarded_foreign,
            AnnouncementError::InvalidKey | AnnouncementError::BadSignature => {
                &self.inner.discarded_unverified
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payloads_discarded(&self) -> u64 {
        self.inner.discarded_malformed.load(Ordering::Relaxed)
            + self.inner.discarded_foreign.load(Ordering::Relaxed)
            + self.inner.discarded_unverified.load(Ordering::Relaxed)
    }

    pub fn unverified_discarded(&self) -> u64 {
        self.inner.discarded_unverified.load(Ordering::Relaxed)
    }

    // Persistence

    pub fn save_completed(&self) {
        self.inner.saves_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn save_failed(&self) {
        self.inner.saves_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn saves_completed(&self) -> u64 {
        self.inner.saves_completed.load(Ordering::Relaxed)
    }

    pub fn saves_failed(&self) -> u64 {
        self.inner.saves_failed.load(Ordering::Relaxed)
    }

    // Queries

    pub fn lookup_hit(&self) {
        self.inner.lookup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookup_missed(&self) {
        self.inner.lookup_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookup_ambiguous(&self) {
        self.inner.lookup_ambiguous.fetch_add(1, Ordering::Relaxed);
    }

    /// Lookups served, whatever the outcome
    pub fn lookups(&self) -> u64 {
        self.inner.lookup_hits.load(Ordering::Relaxed)
            + self.inner.lookup_misses.load(Ordering::Relaxed)
            + self.inner.lookup_ambiguous.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, height: u64, host_count: usize) -> String {
        let inner = &self.inner;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        format!(
            "# HELP shard_height Current block height of the host index\n\
             # TYPE shard_height gauge\n\
             shard_height {}\n\
             \n\
             # HELP shard_hosts Number of hosts with a recorded announcement\n\
             # TYPE shard_hosts gauge\n\
             shard_hosts {}\n\
             \n\
             # HELP shard_uptime_seconds Time since the relay started in seconds\n\
             # TYPE shard_uptime_seconds counter\n\
             shard_uptime_seconds {}\n\
             \n\
             # HELP shard_consensus_changes_total Consensus changes processed\n\
             # TYPE shard_consensus_changes_total counter\n\
             shard_consensus_changes_total {}\n\
             \n\
             # HELP shard_blocks_applied_total Blocks applied\n\
             # TYPE shard_blocks_applied_total counter\n\
             shard_blocks_applied_total {}\n\
             \n\
             # HELP shard_blocks_reverted_total Blocks reverted\n\
             # TYPE shard_blocks_reverted_total counter\n\
             shard_blocks_reverted_total {}\n\
             \n\
             # HELP shard_announcements_applied_total Verified announcements written to the index\n\
             # TYPE shard_announcements_applied_total counter\n\
             shard_announcements_applied_total {}\n\
             \n\
             # HELP shard_announcements_retracted_total Announcements removed because their block was reverted\n\
             # TYPE shard_announcements_retracted_total counter\n\
             shard_announcements_retracted_total {}\n\
             \n\
             # HELP shard_resyncs_total Times the index was rebuilt from genesis\n\
             # TYPE shard_resyncs_total counter\n\
             shard_resyncs_total {}\n\
             \n\
             # HELP shard_payloads_discarded_total Arbitrary data payloads rejected as announcements\n\
             # TYPE shard_payloads_discarded_total counter\n\
             shard_payloads_discarded_total{{reason=\"malformed\"}} {}\n\
             shard_payloads_discarded_total{{reason=\"foreign\"}} {}\n\
             shard_payloads_discarded_total{{reason=\"unverified\"}} {}\n\
             \n\
             # HELP shard_saves_total Index snapshots written, by outcome\n\
             # TYPE shard_saves_total counter\n\
             shard_saves_total{{outcome=\"ok\"}} {}\n\
             shard_saves_total{{outcome=\"error\"}} {}\n\
             \n\
             # HELP shard_lookups_total Host lookups served, by outcome\n\
             # TYPE shard_lookups_total counter\n\
             shard_lookups_total{{outcome=\"hit\"}} {}\n\
             shard_lookups_total{{outcome=\"miss\"}} {}\n\
             shard_lookups_total{{outcome=\"ambiguous\"}} {}\n",
            height,
            host_count,
            self.uptime_seconds(),
            load(&inner.changes_processed),
            load(&inner.blocks_applied),
            load(&inner.blocks_reverted),
            load(&inner.announcements_applied),
            load(&inner.announcements_retracted),
            load(&inner.resyncs),
            load(&inner.discarded_malformed),
            load(&inner.discarded_foreign),
            load(&inner.discarded_unverified),
            load(&inner.saves_completed),
            load(&inner.saves_failed),
            load(&inner.lookup_hits),
            load(&inner.lookup_misses),
            load(&inner.lookup_ambiguous),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
