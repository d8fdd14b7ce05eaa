//! An HTTP-only BitTorrent tracker client: builds the announce GET request,
//! decodes the bencoded response and its compact peer list.

use std::{net::SocketAddr, net::SocketAddrV4, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use thiserror::Error as ThisError;

use crate::{PeerId, Sha1Hash};

/// Errors that can occur while talking to a tracker.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode tracker response: {0}")]
    Decode(#[from] serde_bencode::Error),

    #[error("tracker returned failure reason: {0}")]
    Failure(String),

    #[error("tracker announce url is invalid: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(with = "serde_bytes")]
    #[serde(default)]
    peers: Vec<u8>,
}

/// The parsed result of an announce: how long to wait before the next one
/// and the peer addresses the tracker handed back.
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// A client for a single torrent's HTTP tracker.
pub struct TrackerClient {
    http: reqwest::Client,
    announce_url: String,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
}

impl TrackerClient {
    /// Creates a new client for the given (HTTP) announce URL.
    ///
    /// The URL is parsed (not re-encoded — we build the query string by hand
    /// since `info_hash`/`peer_id` are raw bytes, not valid UTF-8 in
    /// general) purely to reject a malformed announce URL up front.
    pub fn new(
        announce_url: String,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
    ) -> Result<Self, Error> {
        url::Url::parse(&announce_url)?;
        Ok(Self {
            http: reqwest::Client::new(),
            announce_url,
            info_hash,
            peer_id,
            port,
        })
    }

    /// Performs the initial announce to the tracker.
    pub async fn announce(&self, left: u64) -> Result<TrackerResponse, Error> {
        self.request(0, 0, left, Some("started")).await
    }

    /// Performs a subsequent re-announce with updated progress counters.
    pub async fn connect(
        &self,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<TrackerResponse, Error> {
        self.request(uploaded, downloaded, left, None).await
    }

    async fn request(
        &self,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Option<&str>,
    ) -> Result<TrackerResponse, Error> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            encode_bytes(&self.info_hash),
            encode_bytes(&self.peer_id),
            self.port,
            uploaded,
            downloaded,
            left,
        );
        if let Some(event) = event {
            url.push_str("&event=");
            url.push_str(event);
        }

        log::debug!("announcing to tracker: {}", self.announce_url);
        let body = self.http.get(&url).send().await?.bytes().await?;
        let raw: RawResponse = serde_bencode::from_bytes(&body)?;

        if let Some(reason) = raw.failure_reason {
            return Err(Error::Failure(reason));
        }

        let interval = Duration::from_secs(raw.interval.unwrap_or(300).max(0) as u64);
        let peers = decode_compact_peers(&raw.peers);

        Ok(TrackerResponse { interval, peers })
    }
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Decodes a tracker's compact peer list: 6 bytes per peer, 4 bytes of
/// big-endian IPv4 address followed by a 2 byte big-endian port. Trailing
/// bytes that don't form a full entry are ignored.
fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
        let peers = decode_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn decodes_compact_peer_list_ignoring_trailing_partial_entry() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 1, 2, 3];
        let peers = decode_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
    }
}
