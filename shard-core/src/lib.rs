//! SHARD Core
//!
//! Indexes the host announcements published on chain and serves the latest
//! announcement of each host by public key or key prefix.

pub mod announcement;
pub mod api;
mod b64;
pub mod chain;
pub mod client;
pub mod config;
pub mod follower;
pub mod index;
pub mod metrics;
pub mod persist;
pub mod relay;
pub mod runtime;
mod saver;

#[cfg(test)]
mod testutil;

pub use announcement::{
    verify_announcement, AnnouncementError, HostAnnouncement, HostPublicKey, SignedAnnouncement,
};
pub use api::create_router;
pub use chain::{
    Block, ChainError, ChangeId, ConsensusChange, ConsensusSet, ConsensusSubscriber, MemoryChain,
    Transaction,
};
pub use client::{ClientError, ShardClient};
pub use config::{Command, Config, ConfigError};
pub use follower::HttpChain;
pub use index::{HostIndex, HostMatch};
pub use metrics::Metrics;
pub use persist::{JsonPersist, MemoryPersist, PersistData, PersistError, Persister};
pub use relay::{Relay, RelayError, DEFAULT_SAVE_DELAY};
pub use runtime::{run_relay, RuntimeError};
