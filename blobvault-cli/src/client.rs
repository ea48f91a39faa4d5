//! HTTP client for a BlobVault server

use blobvault_core::codec::{self, encode_timestamp, escape_segment};
use blobvault_core::{compression, Timestamp};
use bytes::Bytes;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Server answered {0}")]
    Status(StatusCode),

    #[error("Server did not return a blob id")]
    MissingId,

    #[error(transparent)]
    Storage(#[from] blobvault_core::BlobError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Address of a stored blob: the backend node and its key, both raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAddress {
    pub node: Vec<u8>,
    pub id: Vec<u8>,
}

pub struct BlobClient {
    client: Client,
    base: String,
}

impl BlobClient {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// Upload `blob` into the day of `at`.
    pub async fn post_blob(&self, blob: Bytes, at: Timestamp) -> Result<BlobAddress> {
        let url = timestamp_url(&self.base, "blobs", at);
        debug!(url = %url, len = blob.len(), "Posting blob");

        let resp = self.client.post(&url).body(blob).send().await?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(ClientError::Status(resp.status()));
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .map(|value| codec::decode(value.as_bytes()))
                .unwrap_or_default()
        };
        let address = BlobAddress {
            node: header("node"),
            id: header("id"),
        };
        if address.id.is_empty() {
            return Err(ClientError::MissingId);
        }
        Ok(address)
    }

    /// Fetch a blob and undo the server-side compression.
    pub async fn get_blob(&self, address: &BlobAddress) -> Result<Vec<u8>> {
        let url = blob_url(&self.base, address);
        debug!(url = %url, "Fetching blob");

        let resp = self.client.get(&url).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(ClientError::Status(resp.status()));
        }

        let decompressed_len = resp
            .headers()
            .get("lz4-size")
            .map(|value| parse_lz4_size(value.as_bytes()))
            .unwrap_or(0);
        let body = resp.bytes().await?;
        Ok(compression::decompress(&body, decompressed_len)?)
    }

    /// Ask every backend on the server to drop days before `cutoff`.
    pub async fn expire(&self, cutoff: Timestamp) -> Result<()> {
        let url = timestamp_url(&self.base, "expire", cutoff);
        let method = Method::from_bytes(b"EXPIRE").unwrap_or(Method::POST);

        let resp = self.client.request(method, &url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status()));
        }
        Ok(())
    }
}

fn timestamp_url(base: &str, route: &str, at: Timestamp) -> String {
    format!("{}/{}/{}", base, route, escape_segment(&encode_timestamp(at)))
}

fn blob_url(base: &str, address: &BlobAddress) -> String {
    format!(
        "{}/blobs/{}/{}",
        base,
        escape_segment(&codec::encode(&address.node)),
        escape_segment(&codec::encode(&address.id))
    )
}

/// Decimal digits of the header, anything else skipped
fn parse_lz4_size(raw: &[u8]) -> usize {
    raw.iter()
        .filter(|b| b.is_ascii_digit())
        .fold(0usize, |n, b| n.saturating_mul(10).saturating_add((b - b'0') as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobvault_core::codec::{decode_timestamp, unescape_segment};

    #[test]
    fn test_timestamp_url() {
        let url = timestamp_url("http://localhost:8086", "expire", -86_400);
        let segment = url.rsplit('/').next().unwrap();
        assert!(segment.is_ascii());
        assert_eq!(decode_timestamp(&unescape_segment(segment)), -86_400);
    }

    #[test]
    fn test_blob_url_roundtrip() {
        let address = BlobAddress {
            node: b"0f8e2c1a-node".to_vec(),
            id: vec![0x00, 0xff, b'/', b'%', 0x7f],
        };
        let url = blob_url("http://localhost:8086", &address);
        let mut parts = url.rsplitn(3, '/');
        let id = parts.next().unwrap();
        let node = parts.next().unwrap();

        assert_eq!(codec::decode(&unescape_segment(node)), address.node);
        assert_eq!(codec::decode(&unescape_segment(id)), address.id);
    }

    #[test]
    fn test_parse_lz4_size() {
        assert_eq!(parse_lz4_size(b"1234"), 1234);
        assert_eq!(parse_lz4_size(b" 12x3"), 123);
        assert_eq!(parse_lz4_size(b""), 0);
    }
}
