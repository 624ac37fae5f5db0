//! Shared fixtures for unit tests

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::announcement::{HostAnnouncement, HostPublicKey};
use crate::chain::{Block, MemoryChain, Transaction};
use crate::metrics::Metrics;
use crate::persist::{MemoryPersist, PersistData, PersistError, Persister};
use crate::relay::Relay;

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn host_key(seed: u8) -> HostPublicKey {
    HostPublicKey::from_ed25519(&signing_key(seed).verifying_key())
}

/// Signed announcement payload for the host derived from `seed`
pub fn announcement(seed: u8, net_address: &str) -> Bytes {
    let signer = signing_key(seed);
    HostAnnouncement::new(net_address, &signer.verifying_key())
        .sign(&signer)
        .unwrap()
}

/// A block with one transaction per payload
pub fn block(payloads: &[&Bytes]) -> Block {
    Block::new(
        payloads
            .iter()
            .map(|payload| Transaction::new(vec![payload.to_vec()]))
            .collect(),
    )
}

/// Memory store whose first `failures` saves fail
pub struct FlakyPersist {
    failures: AtomicUsize,
    pub saved: MemoryPersist,
}

impl FlakyPersist {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            saved: MemoryPersist::new(),
        }
    }
}

impl Persister for FlakyPersist {
    fn save(&self, data: &PersistData) -> Result<(), PersistError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::Io(std::io::Error::other("disk full")));
        }
        self.saved.save(data)
    }

    fn load(&self) -> Result<PersistData, PersistError> {
        self.saved.load()
    }
}

pub struct Harness {
    pub chain: Arc<MemoryChain>,
    pub persist: Arc<MemoryPersist>,
    pub relay: Arc<Relay>,
}

/// Relay over an empty memory chain and memory store
pub async fn harness(save_delay: Duration) -> Harness {
    harness_with(Arc::new(MemoryChain::new()), Arc::new(MemoryPersist::new()), save_delay).await
}

pub async fn harness_with(
    chain: Arc<MemoryChain>,
    persist: Arc<MemoryPersist>,
    save_delay: Duration,
) -> Harness {
    let relay = Relay::new(chain.clone(), persist.clone(), save_delay, Metrics::new())
        .await
        .unwrap();
    Harness {
        chain,
        persist,
        relay,
    }
}
