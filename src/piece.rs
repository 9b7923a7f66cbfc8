/// Number of availability checks a piece survives before the swarm is
/// considered unable to supply it
pub const PIECE_TTL: u32 = 100;

/// A piece waiting in the work queue.
///
/// Only one worker holds a given `PieceWork` at a time; it moves out of the
/// queue on `pop` and back in on `push`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Index of the piece (0-based)
    pub index: u32,
    /// Expected SHA-1 of the piece content
    pub hash: [u8; 20],
    /// Exact byte length of this piece
    pub length: usize,
    /// Remaining availability checks before giving up on this piece
    pub ttl: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: usize, ttl: u32) -> Self {
        Self {
            index,
            hash,
            length,
            ttl,
        }
    }
}

/// A downloaded piece whose content matched its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    /// Worker that produced the piece, for diagnostics
    pub worker: usize,
    pub content: Vec<u8>,
}

/// Concatenates results in piece order, whatever order they completed in.
pub fn assemble(mut results: Vec<PieceResult>) -> Vec<u8> {
    results.sort_by_key(|r| r.index);
    let total = results.iter().map(|r| r.content.len()).sum();

    let mut out = Vec::with_capacity(total);
    for r in results {
        out.extend_from_slice(&r.content);
    }
    out
}
