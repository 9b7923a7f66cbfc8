use crate::error::ApplicationError;
use crate::peer::Peer;
use crate::torrent::Torrent;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::value::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use url::Url;

/// Port announced to the tracker when none is configured
pub const DEFAULT_PORT: u16 = 6881;

/// Handles communication with a BitTorrent tracker
pub struct Tracker {
    client: Client,
}

/// Represents the response returned by a tracker announce request
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    #[serde(rename = "failure reason", default)]
    pub failure_reason: Option<String>,
    #[serde(rename = "peers", default)]
    pub peers_data: Option<Value>,
    #[serde(rename = "peers6", default)]
    pub peers6_data: Option<serde_bytes::ByteBuf>,
    pub interval: Option<i64>,
}

impl AnnounceResponse {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ApplicationError> {
        let resp: AnnounceResponse = serde_bencode::from_bytes(raw)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        if let Some(reason) = &resp.failure_reason {
            return Err(ApplicationError::TrackerError(reason.clone()));
        }
        Ok(resp)
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut result = Vec::new();

        match &self.peers_data {
            // Compact form: 4-byte IPv4 address then 2-byte big-endian port
            Some(Value::Bytes(data)) => {
                for chunk in data.chunks_exact(6) {
                    let ip   = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    result.push(Peer::new(IpAddr::V4(ip), port));
                }
            }
            // Dictionary form: a list of {"ip": <text>, "port": <int>}
            Some(Value::List(list)) => {
                for item in list {
                    if let Value::Dict(dict) = item {
                        let ip = dict.get(&b"ip".to_vec())
                            .and_then(|v| match v {
                                Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
                                           _    => None,
                            })
                            .and_then(|s| s.parse::<IpAddr>().ok());

                        let port = dict.get(&b"port".to_vec())
                            .and_then(|v| match v {
                                Value::Int(n)   => u16::try_from(*n).ok(),
                                           _    => None,
                            });

                        if let (Some(ip), Some(port)) = (ip, port) {
                            result.push(Peer::new(ip, port));
                        }
                    }
                }
            }
            _ => {}
        }

        // 16-byte IPv6 address then 2-byte big-endian port
        if let Some(data) = &self.peers6_data {
            for chunk in data.chunks_exact(18) {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&chunk[..16]);
                let port = u16::from_be_bytes([chunk[16], chunk[17]]);
                result.push(Peer::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
            }
        }

        result
    }
}

impl Tracker {
    /// Builds the HTTP client used for announces.
    pub fn new() -> Result<Self, ApplicationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;
        Ok(Self { client })
    }

    /// Builds the announce URL for `torrent`, keeping any query the
    /// announce URL already carries.
    pub fn announce_url(torrent: &Torrent, port: u16) -> Result<String, ApplicationError> {
        let base_url = Url::parse(&torrent.announce)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let params = [
            ("info_hash",  percent_encode(&torrent.info_hash, NON_ALPHANUMERIC).to_string()),
            ("peer_id",    percent_encode(&torrent.peer_id, NON_ALPHANUMERIC).to_string()),
            ("port",       port.to_string()),
            ("uploaded",   "0".to_string()),
            ("downloaded", "0".to_string()),
            ("compact",    "1".to_string()),
            ("left",       torrent.length.to_string()),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let separator = if base_url.query().is_some() { '&' } else { '?' };
        Ok(format!("{}{}{}", base_url, separator, query))
    }

    /// Sends an announce request to the tracker and returns the list of peers
    pub async fn announce(&self, torrent: &Torrent, port: u16) -> Result<Vec<Peer>, ApplicationError> {
        let url = Self::announce_url(torrent, port)?;
        info!("fetching peers from {}", torrent.announce);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        if !response.status().is_success() {
            return Err(ApplicationError::TrackerError(format!(
                "tracker responded with {}",
                response.status()
            )));
        }

        let raw = response
            .bytes()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let resp = AnnounceResponse::from_bytes(&raw)?;
        let peers = resp.peers();
        info!(
            "peers fetched, total count: {} (re-announce interval {:?}s)",
            peers.len(),
            resp.interval
        );
        Ok(peers)
    }
}
