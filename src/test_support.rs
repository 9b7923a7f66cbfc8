//! Mock peers and synthetic torrents shared by the unit tests.

use std::{sync::Arc, time::Duration};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    downloader::Config,
    error::ApplicationError,
    peer::Peer,
    protocol::{self, Handshake, Message, MessageId, HANDSHAKE_LEN},
    torrent::Torrent,
};

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

pub fn test_config() -> Config {
    Config {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

/// Torrent metadata describing `data` split into `piece_length` pieces.
pub fn synthetic_torrent(data: &[u8], piece_length: usize) -> Torrent {
    Torrent {
        announce: "http://tracker.invalid/announce".into(),
        name: "synthetic.bin".into(),
        length: data.len() as u64,
        piece_length: piece_length as u64,
        piece_hashes: data.chunks(piece_length).map(sha1).collect(),
        info_hash: sha1(b"synthetic info dictionary"),
        peer_id: *b"-LC0001-000000000000",
    }
}

/// The remote half of a handshake: reads ours, answers with `info_hash`,
/// then announces `bitfield`.
pub async fn peer_side_handshake<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    bitfield: &[u8],
) -> Result<(), ApplicationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut theirs = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut theirs).await?;

    stream
        .write_all(&Handshake::new(info_hash, *b"-MOCK00-000000000000").encode())
        .await?;
    stream
        .write_all(&Message::with_payload(MessageId::Bitfield, bitfield.to_vec()).encode())
        .await?;
    stream.flush().await?;
    Ok(())
}

/// A listening peer that owns all of `data` and answers every request at once.
///
/// Advertises every piece unless `bitfield` overrides it.
pub async fn spawn_seeder(torrent: &Torrent, data: &[u8], bitfield: Option<Vec<u8>>) -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let pieces: Arc<Vec<Vec<u8>>> = Arc::new(
        data.chunks(torrent.piece_length as usize)
            .map(<[u8]>::to_vec)
            .collect(),
    );
    let bitfield = bitfield.unwrap_or_else(|| {
        let mut full = vec![0u8; pieces.len().div_ceil(8)];
        for i in 0..pieces.len() {
            full[i / 8] |= 1 << (7 - i % 8);
        }
        full
    });
    let info_hash = torrent.info_hash;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let pieces = pieces.clone();
            let bitfield = bitfield.clone();
            tokio::spawn(async move {
                let _ = serve(stream, info_hash, pieces, bitfield).await;
            });
        }
    });

    Peer::new(addr.ip(), addr.port())
}

async fn serve(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    pieces: Arc<Vec<Vec<u8>>>,
    bitfield: Vec<u8>,
) -> Result<(), ApplicationError> {
    peer_side_handshake(&mut stream, info_hash, &bitfield).await?;
    stream.write_all(&Message::new(MessageId::Unchoke).encode()).await?;

    loop {
        let msg = protocol::read_message(&mut stream).await?;
        if msg.id != MessageId::Request {
            continue;
        }
        let (index, begin, length) = protocol::parse_request(&msg)?;
        let piece = &pieces[index as usize];
        let block = &piece[begin as usize..(begin + length) as usize];
        stream.write_all(&Message::piece(index, begin, block).encode()).await?;
    }
}

/// An address nothing is listening on.
pub async fn closed_peer() -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Peer::new(addr.ip(), addr.port())
}
