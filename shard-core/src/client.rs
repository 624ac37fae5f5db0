//! Client for a remote relay
//!
//! Announcements fetched from a relay are not taken on trust: the client
//! decodes the raw bytes itself and checks the host's signature before
//! returning an address.

use bytes::Bytes;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::announcement::{AnnouncementError, HostPublicKey, SignedAnnouncement, ED25519_PREFIX};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("no record of that host")]
    NoRecord,

    #[error("ambiguous pubkey")]
    Ambiguous,

    #[error("undecodable announcement: {0}")]
    Announcement(#[from] AnnouncementError),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Talks to a relay's HTTP API
#[derive(Debug, Clone)]
pub struct ShardClient {
    client: reqwest::Client,
    addr: String,
}

impl ShardClient {
    /// `addr` without a scheme is reached over https
    pub fn new(addr: &str) -> Self {
        let addr = if addr.starts_with("https://") || addr.starts_with("http://") {
            addr.to_string()
        } else {
            format!("https://{}", addr)
        };
        Self {
            client: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_string(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn get(&self, route: &str) -> Result<(StatusCode, Bytes), ClientError> {
        let url = format!("{}{}", self.addr, route);
        debug!(%url, "Querying relay");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        match status {
            StatusCode::GONE => Err(ClientError::Ambiguous),
            status if status.is_success() => Ok((status, body)),
            status => Err(ClientError::Server {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    async fn get_text(&self, route: &str) -> Result<String, ClientError> {
        let (_, body) = self.get(route).await?;
        String::from_utf8(body.to_vec())
            .map(|text| text.trim().to_string())
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Fetch and decode the announcement stored for `prefix`
    async fn announcement(&self, prefix: &str) -> Result<SignedAnnouncement, ClientError> {
        let (status, body) = self.get(&format!("/host/{}", prefix)).await?;
        if status == StatusCode::NO_CONTENT || body.is_empty() {
            return Err(ClientError::NoRecord);
        }
        Ok(SignedAnnouncement::decode(&body)?)
    }

    pub async fn chain_height(&self) -> Result<u64, ClientError> {
        let text = self.get_text("/height").await?;
        text.parse()
            .map_err(|_| ClientError::InvalidResponse(format!("bad height {:?}", text)))
    }

    pub async fn synced(&self) -> Result<bool, ClientError> {
        let text = self.get_text("/synced").await?;
        text.parse()
            .map_err(|_| ClientError::InvalidResponse(format!("bad sync status {:?}", text)))
    }

    /// The most recently announced address of `host`
    ///
    /// The signature is checked against `host` itself, so a relay cannot
    /// substitute another host's announcement.
    pub async fn resolve_host_key(&self, host: &HostPublicKey) -> Result<String, ClientError> {
        let key = host.ed25519()?;
        let signed = self.announcement(host.as_str()).await?;
        signed
            .verify_with(&key)
            .map_err(|_| ClientError::InvalidSignature)?;
        Ok(signed.announcement.net_address)
    }

    /// The full key of the host whose key starts with `prefix`
    ///
    /// `prefix` may omit the `ed25519:` algorithm tag.
    pub async fn lookup_host(&self, prefix: &str) -> Result<HostPublicKey, ClientError> {
        let prefix = if prefix.starts_with(ED25519_PREFIX) {
            prefix.to_string()
        } else {
            format!("{}{}", ED25519_PREFIX, prefix)
        };
        let signed = self.announcement(&prefix).await?;
        Ok(signed.announcement.host_key()?)
    }
}
