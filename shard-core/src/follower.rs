//! Following an upstream chain node over HTTP
//!
//! The upstream serves its consensus change log at
//! `GET /consensus/changes?after=<cursor>&limit=<n>`: a JSON array of the
//! changes that follow `after`, oldest first, or `410 Gone` when the cursor is
//! not part of its history. A cursor lost after catch-up makes the subscriber
//! reset, and the follower starts over from genesis.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::chain::{ChainError, ChangeId, ConsensusChange, ConsensusSet, ConsensusSubscriber};

/// Changes requested per poll
pub const DEFAULT_BATCH_LIMIT: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Upstream {
    client: reqwest::Client,
    base: String,
    limit: usize,
}

impl Upstream {
    async fn fetch(&self, after: ChangeId) -> Result<Vec<ConsensusChange>, ChainError> {
        let url = format!("{}/consensus/changes", self.base);
        let response = self
            .client
            .get(&url)
            .query(&[("after", after.to_string()), ("limit", self.limit.to_string())])
            .send()
            .await?;

        match response.status() {
            StatusCode::GONE => Err(ChainError::UnknownChange(after)),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(ChainError::UpstreamStatus {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Hand a batch to the subscriber; returns the new cursor and whether the
    /// batch was full (more may be waiting)
    fn deliver(
        &self,
        subscriber: &dyn ConsensusSubscriber,
        batch: Vec<ConsensusChange>,
        mut cursor: ChangeId,
    ) -> (ChangeId, bool) {
        let full = batch.len() >= self.limit;
        for change in &batch {
            subscriber.process_consensus_change(change);
            cursor = change.id;
        }
        (cursor, full)
    }
}

/// A [`ConsensusSet`] backed by an upstream chain node
pub struct HttpChain {
    upstream: Upstream,
    poll_interval: Duration,
    synced: Arc<AtomicBool>,
}

impl HttpChain {
    pub fn new(base: impl Into<String>, poll_interval: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            upstream: Upstream {
                client,
                base: base.into().trim_end_matches('/').to_string(),
                limit: DEFAULT_BATCH_LIMIT,
            },
            poll_interval,
            synced: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.upstream.limit = limit.max(1);
        self
    }
}

#[async_trait]
impl ConsensusSet for HttpChain {
    /// Catches up inline, then keeps polling in a background task
    async fn subscribe(
        &self,
        subscriber: Arc<dyn ConsensusSubscriber>,
        start: ChangeId,
    ) -> Result<(), ChainError> {
        let mut cursor = start;
        let mut delivered = 0;
        loop {
            let batch = self.upstream.fetch(cursor).await?;
            delivered += batch.len();
            let (next, full) = self.upstream.deliver(subscriber.as_ref(), batch, cursor);
            cursor = next;
            if !full {
                break;
            }
        }
        self.synced.store(true, Ordering::Relaxed);
        info!(
            upstream = %self.upstream.base,
            delivered,
            cursor = %cursor,
            "Caught up with upstream chain"
        );

        tokio::spawn(poll_upstream(
            self.upstream.clone(),
            subscriber,
            cursor,
            self.poll_interval,
            self.synced.clone(),
        ));
        Ok(())
    }

    fn synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }
}

async fn poll_upstream(
    upstream: Upstream,
    subscriber: Arc<dyn ConsensusSubscriber>,
    mut cursor: ChangeId,
    interval: Duration,
    synced: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately and subscribe just fetched
    ticker.tick().await;

    loop {
        ticker.tick().await;

        // drain full batches back to back
        loop {
            match upstream.fetch(cursor).await {
                Ok(batch) => {
                    if !batch.is_empty() {
                        debug!(changes = batch.len(), "Fetched consensus changes");
                    }
                    let (next, full) = upstream.deliver(subscriber.as_ref(), batch, cursor);
                    cursor = next;
                    synced.store(!full, Ordering::Relaxed);
                    if !full {
                        break;
                    }
                }
                Err(ChainError::UnknownChange(lost)) if !lost.is_beginning() => {
                    warn!(
                        cursor = %lost,
                        "Upstream no longer knows our cursor, resyncing from genesis"
                    );
                    synced.store(false, Ordering::Relaxed);
                    subscriber.reset_subscription();
                    cursor = ChangeId::BEGINNING;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to poll upstream chain");
                    synced.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, MemoryChain};
    use axum::extract::{Query, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct ChangesQuery {
        after: ChangeId,
        limit: usize,
    }

    async fn changes(
        State(chain): State<Arc<MemoryChain>>,
        Query(query): Query<ChangesQuery>,
    ) -> Result<Json<Vec<ConsensusChange>>, HttpStatus> {
        chain
            .changes_after(query.after, query.limit)
            .map(Json)
            .map_err(|_| HttpStatus::GONE)
    }

    async fn serve(chain: Arc<MemoryChain>) -> String {
        let app = Router::new()
            .route("/consensus/changes", get(changes))
            .with_state(chain);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ChangeId>>,
        resets: Mutex<usize>,
    }

    impl ConsensusSubscriber for Recorder {
        fn process_consensus_change(&self, change: &ConsensusChange) {
            self.seen.lock().push(change.id);
        }

        fn reset_subscription(&self) {
            self.seen.lock().clear();
            *self.resets.lock() += 1;
        }
    }

    /// Upstream whose change log can be replaced, as after a deep reorg
    type Replaceable = Arc<Mutex<Arc<MemoryChain>>>;

    async fn replaceable_changes(
        State(chain): State<Replaceable>,
        Query(query): Query<ChangesQuery>,
    ) -> Result<Json<Vec<ConsensusChange>>, HttpStatus> {
        let chain = chain.lock().clone();
        chain
            .changes_after(query.after, query.limit)
            .map(Json)
            .map_err(|_| HttpStatus::GONE)
    }

    #[tokio::test]
    async fn test_subscribe_drains_backlog_in_batches() {
        let chain = Arc::new(MemoryChain::new());
        let ids: Vec<_> = (0..7)
            .map(|_| chain.push_blocks(vec![Block::default()], vec![]))
            .collect();
        let base = serve(chain).await;

        let follower = HttpChain::new(base, Duration::from_secs(3600))
            .unwrap()
            .with_batch_limit(3);
        let recorder = Arc::new(Recorder::default());
        follower
            .subscribe(recorder.clone(), ChangeId::BEGINNING)
            .await
            .unwrap();

        assert_eq!(*recorder.seen.lock(), ids);
        assert!(follower.synced());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_cursor_fails() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_blocks(vec![Block::default()], vec![]);
        let base = serve(chain).await;

        let follower = HttpChain::new(base, Duration::from_secs(3600)).unwrap();
        let stale = ChangeId::new([7; 32]);
        let result = follower
            .subscribe(Arc::new(Recorder::default()), stale)
            .await;

        assert!(matches!(result, Err(ChainError::UnknownChange(id)) if id == stale));
        assert!(!follower.synced());
    }

    #[tokio::test]
    async fn test_poller_delivers_new_changes() {
        let chain = Arc::new(MemoryChain::new());
        let first = chain.push_blocks(vec![Block::default()], vec![]);
        let base = serve(chain.clone()).await;

        let follower = HttpChain::new(base, Duration::from_millis(20)).unwrap();
        let recorder = Arc::new(Recorder::default());
        follower.subscribe(recorder.clone(), first).await.unwrap();
        assert!(recorder.seen.lock().is_empty());

        let second = chain.push_blocks(vec![Block::default()], vec![]);
        for _ in 0..100 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*recorder.seen.lock(), vec![second]);
    }

    #[tokio::test]
    async fn test_lost_cursor_resets_and_restarts_from_genesis() {
        let chain = Arc::new(MemoryChain::new());
        let first = chain.push_blocks(vec![Block::default()], vec![]);
        let upstream: Replaceable = Arc::new(Mutex::new(chain));
        let app = Router::new()
            .route("/consensus/changes", get(replaceable_changes))
            .with_state(upstream.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let follower =
            HttpChain::new(format!("http://{}", addr), Duration::from_millis(20)).unwrap();
        let recorder = Arc::new(Recorder::default());
        follower
            .subscribe(recorder.clone(), ChangeId::BEGINNING)
            .await
            .unwrap();
        assert_eq!(*recorder.seen.lock(), vec![first]);

        // the upstream forgets every change the follower has seen
        let rebuilt = Arc::new(MemoryChain::new());
        rebuilt.push(ConsensusChange {
            id: ChangeId::new([0x42; 32]),
            applied_blocks: vec![Block::default(); 2],
            reverted_blocks: vec![],
        });
        let expected = rebuilt.push_blocks(vec![Block::default()], vec![]);
        let replayed: Vec<_> = rebuilt
            .changes_after(ChangeId::BEGINNING, 10)
            .unwrap()
            .iter()
            .map(|change| change.id)
            .collect();
        *upstream.lock() = rebuilt;

        for _ in 0..100 {
            if recorder.seen.lock().last() == Some(&expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*recorder.resets.lock(), 1);
        assert_eq!(*recorder.seen.lock(), replayed);
        assert!(follower.synced());
    }

    #[tokio::test]
    async fn test_upstream_error_status() {
        let app = Router::new().route(
            "/consensus/changes",
            get(|| async { (HttpStatus::SERVICE_UNAVAILABLE, "syncing") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let follower = HttpChain::new(format!("http://{}/", addr), Duration::from_secs(1)).unwrap();
        let result = follower
            .subscribe(Arc::new(Recorder::default()), ChangeId::BEGINNING)
            .await;

        assert!(matches!(
            result,
            Err(ChainError::UpstreamStatus { status: 503, ref message }) if message == "syncing"
        ));
    }
}
