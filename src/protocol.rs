use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame accepted from a peer, id byte included
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent in a connection and is always 68 bytes.
/// It identifies the torrent being requested (`info_hash`) and the client (`peer_id`).
pub struct Handshake {
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string used to identify the client
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..1 + PROTOCOL_STR.len()].copy_from_slice(PROTOCOL_STR.as_bytes());
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }
}

/// Reads a handshake reply and returns the info hash it carries.
///
/// The protocol string length is taken from the first byte rather than
/// assumed, so peers announcing a different identifier are still parsed.
/// Comparing the hash against the expected one is up to the caller.
pub async fn read_handshake<R>(reader: &mut R) -> Result<[u8; 20], ApplicationError>
where
    R: AsyncRead + Unpin,
{
    let pstrlen = reader.read_u8().await? as usize;
    if pstrlen == 0 {
        return Err(ApplicationError::ProtocolError(
            "handshake protocol string is empty".into(),
        ));
    }

    let mut buf = vec![0u8; 48 + pstrlen];
    reader.read_exact(&mut buf).await?;

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[pstrlen + 8..pstrlen + 28]);
    Ok(info_hash)
}

/// Identifier of a post-handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    /// Zero-length frame; has no id byte on the wire
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    /// Any id this client does not understand (extensions, DHT port, ...)
    Unknown(u8),
}

impl MessageId {
    fn from_byte(id: u8) -> Self {
        match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            other => MessageId::Unknown(other),
        }
    }

    fn as_byte(self) -> Option<u8> {
        match self {
            MessageId::KeepAlive => None,
            MessageId::Choke => Some(0),
            MessageId::Unchoke => Some(1),
            MessageId::Interested => Some(2),
            MessageId::NotInterested => Some(3),
            MessageId::Have => Some(4),
            MessageId::Bitfield => Some(5),
            MessageId::Request => Some(6),
            MessageId::Piece => Some(7),
            MessageId::Cancel => Some(8),
            MessageId::Unknown(id) => Some(id),
        }
    }
}

/// A framed peer wire message: `<length><id><payload>`.
///
/// The payload is kept raw; typed views are extracted with [`parse_have`],
/// [`parse_piece`] and friends only where the download loop needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn keep_alive() -> Self {
        Self::new(MessageId::KeepAlive)
    }

    #[cfg(test)]
    pub fn have(index: u32) -> Self {
        Self::with_payload(MessageId::Have, index.to_be_bytes().to_vec())
    }

    /// `request` message asking for `length` bytes at `begin` within piece `index`.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = vec![0u8; 12];
        BigEndian::write_u32(&mut payload[0..4], index);
        BigEndian::write_u32(&mut payload[4..8], begin);
        BigEndian::write_u32(&mut payload[8..12], length);
        Self::with_payload(MessageId::Request, payload)
    }

    /// `piece` message carrying `block` at `begin` within piece `index`.
    #[cfg(test)]
    pub fn piece(index: u32, begin: u32, block: &[u8]) -> Self {
        let mut payload = vec![0u8; 8 + block.len()];
        BigEndian::write_u32(&mut payload[0..4], index);
        BigEndian::write_u32(&mut payload[4..8], begin);
        payload[8..].copy_from_slice(block);
        Self::with_payload(MessageId::Piece, payload)
    }

    /// Serializes a `Message` into a byte vector for transmission.
    ///
    /// Keep-alives encode as a bare zero length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let Some(id) = self.id.as_byte() else {
            return vec![0u8; 4];
        };

        let mut buf = vec![0u8; 5 + self.payload.len()];
        BigEndian::write_u32(&mut buf[0..4], (1 + self.payload.len()) as u32);
        buf[4] = id;
        buf[5..].copy_from_slice(&self.payload);
        buf
    }
}

/// Reads one length-prefixed message from `reader`.
///
/// A zero length prefix yields a keep-alive with an empty payload. Frames
/// longer than [`MAX_MESSAGE_SIZE`] are rejected before anything is allocated.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ApplicationError>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await? as usize;
    if size == 0 {
        return Ok(Message::keep_alive());
    }
    if size > MAX_MESSAGE_SIZE {
        return Err(ApplicationError::ProtocolError(format!(
            "message of {} bytes exceeds limit of {}",
            size, MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;

    let id = MessageId::from_byte(buf[0]);
    buf.remove(0);
    Ok(Message::with_payload(id, buf))
}

/// Extracts the piece index from a `have` message.
pub fn parse_have(msg: &Message) -> Result<u32, ApplicationError> {
    if msg.id != MessageId::Have {
        return Err(ApplicationError::ProtocolError(format!(
            "expected have message, got {:?}",
            msg.id
        )));
    }
    if msg.payload.len() != 4 {
        return Err(ApplicationError::ProtocolError(format!(
            "invalid have payload length {}",
            msg.payload.len()
        )));
    }
    Ok(BigEndian::read_u32(&msg.payload))
}

/// Extracts `(block, begin)` from a `piece` message after checking it
/// belongs to piece `index` and fits inside `piece_len` bytes.
pub fn parse_piece(
    index: u32,
    piece_len: usize,
    msg: &Message,
) -> Result<(&[u8], usize), ApplicationError> {
    if msg.id != MessageId::Piece {
        return Err(ApplicationError::ProtocolError(format!(
            "expected piece message, got {:?}",
            msg.id
        )));
    }
    if msg.payload.len() < 8 {
        return Err(ApplicationError::ProtocolError(format!(
            "piece payload too short ({} bytes)",
            msg.payload.len()
        )));
    }

    let got = BigEndian::read_u32(&msg.payload[0..4]);
    if got != index {
        return Err(ApplicationError::ProtocolError(format!(
            "expected piece #{}, got #{}",
            index, got
        )));
    }

    let begin = BigEndian::read_u32(&msg.payload[4..8]) as usize;
    if begin > piece_len {
        return Err(ApplicationError::ProtocolError(format!(
            "block offset {} beyond piece length {}",
            begin, piece_len
        )));
    }

    let block = &msg.payload[8..];
    if begin + block.len() > piece_len {
        return Err(ApplicationError::ProtocolError(format!(
            "block [{}, {}) overflows piece length {}",
            begin,
            begin + block.len(),
            piece_len
        )));
    }

    Ok((block, begin))
}

/// Extracts `(index, begin, length)` from a `request` or `cancel` message.
#[cfg(test)]
pub fn parse_request(msg: &Message) -> Result<(u32, u32, u32), ApplicationError> {
    if msg.payload.len() != 12 {
        return Err(ApplicationError::ProtocolError(format!(
            "invalid request payload length {}",
            msg.payload.len()
        )));
    }
    Ok((
        BigEndian::read_u32(&msg.payload[0..4]),
        BigEndian::read_u32(&msg.payload[4..8]),
        BigEndian::read_u32(&msg.payload[8..12]),
    ))
}
