use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf},
    net::TcpStream,
    time::timeout,
};

use crate::{
    bitfield::Bitfield,
    downloader::Config,
    error::ApplicationError,
    piece::PieceWork,
    protocol::{self, Handshake, Message, MessageId},
};

/// Upper bound on unanswered block requests per connection
pub const MAX_PENDING_REQUESTS: usize = 5;

/// Largest block requested in a single message
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// An established, handshaken connection to one peer.
///
/// Owns the socket halves, the peer's bitfield and whether the peer is
/// currently choking us. Generic over the stream so tests can drive it
/// through an in-memory pipe.
pub struct PeerConnection<S = TcpStream> {
    addr:         SocketAddr,
    choked:       bool,
    bitfield:     Bitfield,
    reader:       BufReader<ReadHalf<S>>,
    writer:       BufWriter<WriteHalf<S>>,
    read_timeout: Duration,
    max_pending:  usize,
    block_size:   usize,
}

impl PeerConnection<TcpStream> {
    /// Opens a TCP connection within the configured timeout, then handshakes.
    ///
    /// A connect that loses the race against the timer is dropped, which
    /// closes the socket.
    pub async fn connect(
        peer:      &Peer,
        info_hash: [u8; 20],
        peer_id:   [u8; 20],
        config:    &Config,
    ) -> Result<Self, ApplicationError> {
        let addr = peer.addr();
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ApplicationError::Timeout(addr))??;

        Self::establish(stream, addr, info_hash, peer_id, config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Runs the handshake and waits for the peer's bitfield.
    ///
    /// The first message after the handshake must be a bitfield; anything
    /// else fails the connection.
    pub async fn establish(
        stream:    S,
        addr:      SocketAddr,
        info_hash: [u8; 20],
        peer_id:   [u8; 20],
        config:    &Config,
    ) -> Result<Self, ApplicationError> {
        let (rh, wh) = tokio::io::split(stream);

        let mut conn = PeerConnection {
            addr,
            choked: true,
            bitfield: Bitfield::default(),
            reader: BufReader::new(rh),
            writer: BufWriter::new(wh),
            read_timeout: config.read_timeout,
            max_pending: config.max_pending_requests.max(1),
            block_size: config.block_size.max(1),
        };

        debug!("handshaking with {}", addr);
        conn.writer
            .write_all(&Handshake::new(info_hash, peer_id).encode())
            .await?;
        conn.writer.flush().await?;

        let remote_hash = match timeout(conn.read_timeout, protocol::read_handshake(&mut conn.reader)).await {
            Ok(res) => res?,
            Err(_) => return Err(ApplicationError::Timeout(addr)),
        };
        if remote_hash != info_hash {
            return Err(ApplicationError::InfoHashMismatch);
        }

        let msg = conn.read_message().await?;
        if msg.id != MessageId::Bitfield {
            return Err(ApplicationError::ProtocolError(format!(
                "expected bitfield after handshake, got {:?}",
                msg.id
            )));
        }
        conn.bitfield = Bitfield::new(msg.payload);
        debug!(
            "bitfield received from {} ({} bytes)",
            addr,
            conn.bitfield.as_bytes().len()
        );

        Ok(conn)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index as usize)
    }

    pub async fn send_unchoke(&mut self) -> Result<(), ApplicationError> {
        self.send(Message::new(MessageId::Unchoke)).await
    }

    pub async fn send_interested(&mut self) -> Result<(), ApplicationError> {
        self.send(Message::new(MessageId::Interested)).await
    }

    async fn send(&mut self, msg: Message) -> Result<(), ApplicationError> {
        self.writer.write_all(&msg.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Message, ApplicationError> {
        match timeout(self.read_timeout, protocol::read_message(&mut self.reader)).await {
            Ok(res) => res,
            Err(_) => Err(ApplicationError::Timeout(self.addr)),
        }
    }

    /// Downloads and verifies one piece, returning its content.
    ///
    /// Keeps up to `max_pending` block requests in flight while unchoked and
    /// places each arriving block by the offset it carries, so responses
    /// may come back in any order.
    pub async fn download(&mut self, work: &PieceWork) -> Result<Vec<u8>, ApplicationError> {
        let mut buf = vec![0u8; work.length];
        let mut downloaded: usize = 0;
        let mut requested: usize = 0;
        let mut pending: usize = 0;

        while downloaded < work.length {
            if !self.choked && pending < self.max_pending && requested < work.length {
                while pending < self.max_pending && requested < work.length {
                    let size = self.block_size.min(work.length - requested);
                    let request = Message::request(work.index, requested as u32, size as u32);
                    self.writer.write_all(&request.encode()).await?;
                    pending += 1;
                    requested += size;
                }
                self.writer.flush().await?;
            }

            let msg = self.read_message().await?;
            match msg.id {
                MessageId::Unchoke => {
                    self.choked = false;
                }
                MessageId::Choke => {
                    debug!("{} choked us", self.addr);
                    self.choked = true;
                }
                MessageId::Have => {
                    let index = protocol::parse_have(&msg)?;
                    self.bitfield.set_piece(index as usize);
                }
                MessageId::Piece => {
                    let (block, begin) = protocol::parse_piece(work.index, work.length, &msg)?;
                    buf[begin..begin + block.len()].copy_from_slice(block);
                    downloaded += block.len();
                    pending = pending.saturating_sub(1);
                }
                _ => {}
            }
        }

        if Sha1::digest(&buf)[..] != work.hash[..] {
            return Err(ApplicationError::HashMismatch { index: work.index });
        }

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{peer_side_handshake, sha1, test_config};
    use tokio::io::{AsyncReadExt, DuplexStream};

    const INFO_HASH: [u8; 20] = [0x11; 20];
    const PEER_ID: [u8; 20] = *b"-LC0001-000000000001";

    fn local() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    async fn connected(bitfield: &[u8]) -> (PeerConnection<DuplexStream>, DuplexStream) {
        let (client, mut remote) = tokio::io::duplex(1 << 20);
        let bitfield = bitfield.to_vec();
        let remote_task = tokio::spawn(async move {
            peer_side_handshake(&mut remote, INFO_HASH, &bitfield).await.unwrap();
            remote
        });

        let conn = PeerConnection::establish(client, local(), INFO_HASH, PEER_ID, &test_config())
            .await
            .unwrap();
        (conn, remote_task.await.unwrap())
    }

    /// Answers requests for `data` newest-first once the client's window is
    /// full, checking the window never exceeds the pipeline limit.
    async fn serve_out_of_order(mut remote: DuplexStream, index: u32, data: Vec<u8>) -> usize {
        let blocks = data.len().div_ceil(BLOCK_SIZE);
        let mut outstanding: Vec<(u32, u32)> = Vec::new();
        let mut answered = 0;
        let mut max_seen = 0;

        while answered < blocks {
            let msg = protocol::read_message(&mut remote).await.unwrap();
            if msg.id != MessageId::Request {
                continue;
            }
            let (got, begin, length) = protocol::parse_request(&msg).unwrap();
            assert_eq!(got, index);
            outstanding.push((begin, length));
            max_seen = max_seen.max(outstanding.len());
            assert!(outstanding.len() <= MAX_PENDING_REQUESTS);

            if outstanding.len() == MAX_PENDING_REQUESTS.min(blocks - answered) {
                while let Some((begin, length)) = outstanding.pop() {
                    let range = begin as usize..(begin + length) as usize;
                    let reply = Message::piece(index, begin, &data[range]);
                    remote.write_all(&reply.encode())
                        .await
                        .unwrap();
                    answered += 1;
                }
            }
        }
        max_seen
    }

    #[tokio::test]
    async fn establishes_and_reads_bitfield() {
        let (conn, _remote) = connected(&[0b1010_0000]).await;
        assert!(conn.choked);
        assert!(conn.has_piece(0));
        assert!(!conn.has_piece(1));
        assert!(conn.has_piece(2));
        assert!(!conn.has_piece(64));
    }

    #[tokio::test]
    async fn rejects_foreign_info_hash() {
        let (client, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            peer_side_handshake(&mut remote, [0x22; 20], &[0xff]).await.ok();
            let mut sink = Vec::new();
            remote.read_to_end(&mut sink).await.ok();
        });

        let res = PeerConnection::establish(client, local(), INFO_HASH, PEER_ID, &test_config()).await;
        assert!(matches!(res, Err(ApplicationError::InfoHashMismatch)));
    }

    #[tokio::test]
    async fn first_message_must_be_bitfield() {
        let (client, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut hs = [0u8; protocol::HANDSHAKE_LEN];
            remote.read_exact(&mut hs).await.unwrap();
            let reply = Handshake::new(INFO_HASH, [3; 20]).encode();
            remote.write_all(&reply).await.unwrap();
            let unchoke = Message::new(MessageId::Unchoke).encode();
            remote.write_all(&unchoke).await.unwrap();
            let mut sink = Vec::new();
            remote.read_to_end(&mut sink).await.ok();
        });

        let res = PeerConnection::establish(client, local(), INFO_HASH, PEER_ID, &test_config()).await;
        assert!(matches!(res, Err(ApplicationError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn assembles_piece_from_out_of_order_blocks() {
        let data: Vec<u8> = (0..BLOCK_SIZE * 7 + 100).map(|i| (i * 31 % 251) as u8).collect();
        let work = PieceWork::new(2, sha1(&data), data.len(), 100);

        let (mut conn, mut remote) = connected(&[0xff]).await;
        let unchoke = Message::new(MessageId::Unchoke).encode();
        remote.write_all(&unchoke).await.unwrap();

        let server = tokio::spawn(serve_out_of_order(remote, 2, data.clone()));
        let content = conn.download(&work).await.unwrap();

        assert_eq!(content, data);
        assert_eq!(sha1(&content), work.hash);
        assert_eq!(server.await.unwrap(), MAX_PENDING_REQUESTS);
    }

    #[tokio::test]
    async fn corrupt_piece_fails_verification() {
        let data = vec![7u8; 3000];
        let work = PieceWork::new(0, sha1(&data), data.len(), 100);

        let (mut conn, mut remote) = connected(&[0x80]).await;
        let mut corrupt = data.clone();
        corrupt[1234] ^= 0xff;

        let unchoke = Message::new(MessageId::Unchoke).encode();
        remote.write_all(&unchoke).await.unwrap();
        let server = tokio::spawn(serve_out_of_order(remote, 0, corrupt));

        let res = conn.download(&work).await;
        assert!(matches!(res, Err(ApplicationError::HashMismatch { index: 0 })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_unchoke_and_tracks_have() {
        let data = vec![9u8; 100];
        let work = PieceWork::new(1, sha1(&data), data.len(), 100);
        let (mut conn, mut remote) = connected(&[0x00]).await;

        let peer = tokio::spawn(async move {
            // Nothing may be requested before the unchoke.
            let script = [
                Message::keep_alive(),
                Message::have(1),
                Message::with_payload(MessageId::Unknown(20), vec![1, 2, 3]),
                Message::new(MessageId::Unchoke),
            ];
            for msg in script {
                remote.write_all(&msg.encode()).await.unwrap();
            }

            let request = protocol::read_message(&mut remote).await.unwrap();
            assert_eq!(protocol::parse_request(&request).unwrap(), (1, 0, 100));
            let reply = Message::piece(1, 0, &[9u8; 100]);
            remote.write_all(&reply.encode()).await.unwrap();
            remote
        });

        assert!(!conn.has_piece(1));
        let content = conn.download(&work).await.unwrap();
        assert_eq!(content, data);
        assert!(conn.has_piece(1));
        assert!(!conn.choked);
        peer.await.unwrap();
    }

    async fn next_request(remote: &mut DuplexStream) -> (u32, u32, u32) {
        loop {
            let msg = protocol::read_message(remote).await.unwrap();
            if msg.id == MessageId::Request {
                return protocol::parse_request(&msg).unwrap();
            }
        }
    }

    async fn stays_quiet(remote: &mut DuplexStream) -> bool {
        let quiet = Duration::from_millis(100);
        timeout(quiet, protocol::read_message(remote)).await.is_err()
    }

    #[tokio::test]
    async fn choke_pauses_requests_until_unchoke() {
        let blocks = 10;
        let data: Vec<u8> = (0..BLOCK_SIZE * blocks).map(|i| (i % 239) as u8).collect();
        let work = PieceWork::new(0, sha1(&data), data.len(), 100);
        let (mut conn, mut remote) = connected(&[0x80]).await;

        let expected = data.clone();
        let peer = tokio::spawn(async move {
            let reply = |(index, begin, length): (u32, u32, u32)| {
                let range = begin as usize..(begin + length) as usize;
                Message::piece(index, begin, &expected[range]).encode()
            };

            remote.write_all(&Message::new(MessageId::Unchoke).encode()).await.unwrap();
            let mut outstanding = Vec::new();
            for _ in 0..MAX_PENDING_REQUESTS {
                outstanding.push(next_request(&mut remote).await);
            }
            assert!(stays_quiet(&mut remote).await);

            // Blocks already in flight still land while choked.
            remote.write_all(&Message::new(MessageId::Choke).encode()).await.unwrap();
            for _ in 0..2 {
                let request = outstanding.remove(0);
                remote.write_all(&reply(request)).await.unwrap();
            }
            assert!(stays_quiet(&mut remote).await);

            remote.write_all(&Message::new(MessageId::Unchoke).encode()).await.unwrap();
            for _ in 0..2 {
                outstanding.push(next_request(&mut remote).await);
            }
            assert_eq!(outstanding.len(), MAX_PENDING_REQUESTS);
            assert!(stays_quiet(&mut remote).await);

            let mut requested = MAX_PENDING_REQUESTS + 2;
            while !outstanding.is_empty() {
                let request = outstanding.remove(0);
                remote.write_all(&reply(request)).await.unwrap();
                if requested < blocks {
                    outstanding.push(next_request(&mut remote).await);
                    requested += 1;
                }
                assert!(outstanding.len() <= MAX_PENDING_REQUESTS);
            }
            remote
        });

        let content = conn.download(&work).await.unwrap();
        assert_eq!(content, data);
        assert!(!conn.choked);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_bounds_block_is_rejected() {
        let work = PieceWork::new(0, [0; 20], 100, 100);
        let (mut conn, mut remote) = connected(&[0x80]).await;

        let script = [Message::new(MessageId::Unchoke), Message::piece(0, 95, &[0u8; 10])];
        for msg in script {
            remote.write_all(&msg.encode()).await.unwrap();
        }

        let res = conn.download(&work).await;
        assert!(matches!(res, Err(ApplicationError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn closed_stream_loses_connection() {
        let work = PieceWork::new(0, [0; 20], 100, 100);
        let (mut conn, remote) = connected(&[0x80]).await;
        drop(remote);

        let err = conn.download(&work).await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let work = PieceWork::new(0, [0; 20], 100, 100);
        let (mut conn, _remote) = connected(&[0x80]).await;

        let err = conn.download(&work).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Timeout(_)));
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = Peer::new(addr.ip(), addr.port());
        let res = PeerConnection::connect(&peer, INFO_HASH, PEER_ID, &test_config()).await;
        let Err(err) = res else {
            panic!("connected to a closed port");
        };
        assert!(err.is_connection_lost());
    }
}
