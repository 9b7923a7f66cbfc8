/// Pieces a remote peer has announced, one bit per piece.
///
/// Bits are stored most-significant-bit first within each byte, as sent on
/// the wire. Indices beyond the buffer are never present and cannot be set,
/// so a short or malformed bitfield from a peer is harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Returns `true` if the bit for `index` is set.
    pub fn has_piece(&self, index: usize) -> bool {
        let offset = index % 8;
        self.bytes
            .get(index / 8)
            .map(|byte| byte >> (7 - offset) & 1 != 0)
            .unwrap_or(false)
    }

    /// Sets the bit for `index`; out of range indices are ignored.
    pub fn set_piece(&mut self, index: usize) {
        let offset = index % 8;
        if let Some(byte) = self.bytes.get_mut(index / 8) {
            *byte |= 1 << (7 - offset);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
