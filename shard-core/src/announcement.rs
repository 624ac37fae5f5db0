//! Host announcements: wire format, signature verification and extraction
//! from block arbitrary data.
//!
//! An announcement is a bincode-encoded [`SignedAnnouncement`] placed in a
//! transaction's arbitrary data. Only payloads that decode, carry the
//! `HostAnnouncement` specifier and are signed by the key they embed are
//! indexed; everything else on chain is background noise and is discarded
//! without surfacing an error.

use bincode::Options;
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::trace;

use crate::chain::Block;
use crate::metrics::Metrics;

pub type Specifier = [u8; 16];

/// Marks arbitrary data as a host announcement
pub const HOST_ANNOUNCEMENT: Specifier = *b"HostAnnouncement";

/// Key algorithm tag for Ed25519 unlock keys
pub const ED25519: Specifier = *b"ed25519\0\0\0\0\0\0\0\0\0";

/// Text prefix of Ed25519 host public keys
pub const ED25519_PREFIX: &str = "ed25519:";

/// Announcements larger than this are not decoded
pub const MAX_ANNOUNCEMENT_SIZE: u64 = 4096;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ANNOUNCEMENT_SIZE)
}

/// Why a payload was not accepted as a host announcement
#[derive(Debug, Error)]
pub enum AnnouncementError {
    #[error("malformed announcement: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("payload is not a host announcement")]
    NotAnnouncement,

    #[error("unsupported or invalid public key")]
    InvalidKey,

    #[error("signature does not match the announced public key")]
    BadSignature,
}

/// Textual host public key, e.g. `ed25519:<64 hex chars>`
///
/// Keys are ordered by their text, which is what prefix lookups search.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPublicKey(String);

impl HostPublicKey {
    pub fn from_ed25519(key: &VerifyingKey) -> Self {
        Self(format!("{}{}", ED25519_PREFIX, hex::encode(key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The Ed25519 key this text encodes, if it encodes one
    pub fn ed25519(&self) -> Result<VerifyingKey, AnnouncementError> {
        let encoded = self
            .0
            .strip_prefix(ED25519_PREFIX)
            .ok_or(AnnouncementError::InvalidKey)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(encoded, &mut bytes).map_err(|_| AnnouncementError::InvalidKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| AnnouncementError::InvalidKey)
    }
}

impl From<String> for HostPublicKey {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl From<&str> for HostPublicKey {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl Borrow<str> for HostPublicKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A public key tagged with its signature algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockKey {
    pub algorithm: Specifier,
    pub key: Vec<u8>,
}

/// The signed part of an announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAnnouncement {
    pub specifier: Specifier,
    pub net_address: String,
    pub public_key: UnlockKey,
}

impl HostAnnouncement {
    pub fn new(net_address: impl Into<String>, key: &VerifyingKey) -> Self {
        Self {
            specifier: HOST_ANNOUNCEMENT,
            net_address: net_address.into(),
            public_key: UnlockKey {
                algorithm: ED25519,
                key: key.as_bytes().to_vec(),
            },
        }
    }

    /// BLAKE3 digest of the encoded announcement; this is what gets signed
    pub fn digest(&self) -> Result<[u8; 32], AnnouncementError> {
        let encoded = codec().serialize(self)?;
        Ok(blake3::hash(&encoded).into())
    }

    /// The embedded public key
    pub fn verifying_key(&self) -> Result<VerifyingKey, AnnouncementError> {
        if self.public_key.algorithm != ED25519 {
            return Err(AnnouncementError::InvalidKey);
        }
        let bytes: [u8; 32] = self
            .public_key
            .key
            .as_slice()
            .try_into()
            .map_err(|_| AnnouncementError::InvalidKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| AnnouncementError::InvalidKey)
    }

    pub fn host_key(&self) -> Result<HostPublicKey, AnnouncementError> {
        self.verifying_key().map(|key| HostPublicKey::from_ed25519(&key))
    }

    /// Sign and encode, producing the arbitrary-data payload a host publishes
    pub fn sign(self, signer: &SigningKey) -> Result<Bytes, AnnouncementError> {
        let signature = signer.sign(&self.digest()?);
        SignedAnnouncement {
            announcement: self,
            signature: signature.to_bytes().to_vec(),
        }
        .encode()
    }
}

/// An announcement followed by its detached signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAnnouncement {
    pub announcement: HostAnnouncement,
    pub signature: Vec<u8>,
}

impl SignedAnnouncement {
    pub fn decode(payload: &[u8]) -> Result<Self, AnnouncementError> {
        Ok(codec().deserialize(payload)?)
    }

    pub fn encode(&self) -> Result<Bytes, AnnouncementError> {
        Ok(codec().serialize(self)?.into())
    }

    /// Check the signature against `key`, which need not be the embedded one
    pub fn verify_with(&self, key: &VerifyingKey) -> Result<(), AnnouncementError> {
        let digest = self.announcement.digest()?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| AnnouncementError::BadSignature)?;
        key.verify(&digest, &signature)
            .map_err(|_| AnnouncementError::BadSignature)
    }

    /// Full ingestion check: specifier, embedded key and signature
    pub fn verify(&self) -> Result<HostPublicKey, AnnouncementError> {
        if self.announcement.specifier != HOST_ANNOUNCEMENT {
            return Err(AnnouncementError::NotAnnouncement);
        }
        let key = self.announcement.verifying_key()?;
        self.verify_with(&key)?;
        Ok(HostPublicKey::from_ed25519(&key))
    }
}

/// Decide whether one arbitrary-data payload is a valid host announcement
pub fn verify_announcement(payload: &[u8]) -> Result<HostPublicKey, AnnouncementError> {
    SignedAnnouncement::decode(payload)?.verify()
}

/// Valid announcements in `block`, in transaction and payload order
///
/// Each accepted payload is copied verbatim; rejected ones are counted in
/// `metrics` and dropped.
pub fn announcements_in<'a>(
    block: &'a Block,
    metrics: &'a Metrics,
) -> impl Iterator<Item = (HostPublicKey, Bytes)> + 'a {
    block
        .transactions
        .iter()
        .flat_map(|txn| txn.arbitrary_data.iter())
        .filter_map(move |payload| match verify_announcement(payload) {
            Ok(key) => Some((key, Bytes::copy_from_slice(payload))),
            Err(reason) => {
                trace!(%reason, len = payload.len(), "Discarding arbitrary data");
                metrics.payload_discarded(&reason);
                None
            }
        })
}

/// Merge the announcements of `block` into `hosts`; later ones overwrite
pub fn extract_announcements(
    block: &Block,
    hosts: &mut HashMap<HostPublicKey, Bytes>,
    metrics: &Metrics,
) {
    hosts.extend(announcements_in(block, metrics));
}
