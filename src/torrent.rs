use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::ApplicationError;

/// Layout of a .torrent file as it is bencoded on disk
#[derive(Debug, Serialize, Deserialize)]
struct MetaInfo {
    announce: String,
    info: Info,
}

/// Fields inside the 'info' dictionary of a .torrent file
#[derive(Debug, Serialize, Deserialize)]
struct Info {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<serde_bencode::value::Value>,
}

/// Metadata of a single-file torrent, ready to be downloaded.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker announce URL
    pub announce: String,
    /// Suggested output filename
    pub name: String,
    /// Total content length in bytes
    pub length: u64,
    /// Nominal piece length; only the last piece may be shorter
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub info_hash: [u8; 20],
    /// Identifier this client presents to trackers and peers
    pub peer_id: [u8; 20],
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ApplicationError> {
        let data = fs::read(path.as_ref()).map_err(|e| {
            ApplicationError::ParserError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        // The info hash covers the info dictionary exactly as bencoded, so it
        // is re-encoded from the generic value rather than from `Info`.
        let bencoded_map: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data)
                .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let info_value = bencoded_map
            .get("info")
            .ok_or_else(|| ApplicationError::ParserError("missing info".into()))?;

        let info_raw_bytes = serde_bencode::to_bytes(info_value)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let meta: MetaInfo = serde_bencode::from_bytes(data)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        if meta.info.files.is_some() {
            return Err(ApplicationError::ParserError(
                "multi-file torrents are not supported".into(),
            ));
        }

        let length = meta
            .info
            .length
            .ok_or_else(|| ApplicationError::ParserError("missing length".into()))?;
        if length < 0 {
            return Err(ApplicationError::ParserError(format!("invalid length {}", length)));
        }
        if meta.info.piece_length <= 0 {
            return Err(ApplicationError::ParserError(format!(
                "invalid piece length {}",
                meta.info.piece_length
            )));
        }
        if meta.info.pieces.len() % 20 != 0 {
            return Err(ApplicationError::ParserError(
                "pieces length is not a multiple of 20".into(),
            ));
        }

        let piece_hashes: Vec<[u8; 20]> = meta
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect();

        let (length, piece_length) = (length as u64, meta.info.piece_length as u64);
        let expected = length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(ApplicationError::ParserError(format!(
                "expected {} piece hashes, found {}",
                expected,
                piece_hashes.len()
            )));
        }

        let digest = Sha1::digest(&info_raw_bytes);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&digest);

        Ok(Torrent {
            announce: meta.announce,
            name: meta.info.name,
            length,
            piece_length,
            piece_hashes,
            info_hash,
            peer_id: generate_peer_id(),
        })
    }

    /// Returns the number of pieces the torrent is divided into
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of piece `index`; the last one holds the remainder.
    pub fn piece_size(&self, index: usize) -> usize {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        end.saturating_sub(begin) as usize
    }

    pub fn log_info(&self) {
        info!("torrent: {}", self.name);
        info!("  announce: {}", self.announce);
        info!("  info hash: {}", hex::encode(self.info_hash));
        info!("  piece length: {} bytes", self.piece_length);
        info!("  pieces: {}", self.piece_count());
        info!("  total size: {} bytes", self.length);
    }
}

/// `-LC0001-` followed by twelve random digits
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::rng();
    let digits: u64 = rng.random_range(100_000_000_000..=999_999_999_999);

    let mut id = [0u8; 20];
    id.copy_from_slice(format!("-LC0001-{}", digits).as_bytes());
    id
}
