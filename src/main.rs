#[macro_use]
extern crate log;

use crate::{
    downloader::{Config, Downloader, Outcome},
    error::ApplicationError,
    piece::assemble,
    torrent::Torrent,
    tracker::{Tracker, DEFAULT_PORT},
};

use clap::Parser;
use std::path::{Path, PathBuf};

mod bitfield;
mod downloader;
mod error;
mod manager;
mod peer;
mod piece;
mod protocol;
mod torrent;
mod tracker;
mod worker;

#[cfg(test)]
mod test_support;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Downloads a single-file torrent from its swarm without seeding."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to the name inside the torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Port reported to the tracker
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

/// Replaces path separators so a torrent cannot write outside the working directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Writes the assembled content once, after checking it has the torrent's length.
async fn write_output(path: &Path, torrent: &Torrent, content: &[u8]) -> Result<(), ApplicationError> {
    if content.len() as u64 != torrent.length {
        return Err(ApplicationError::WorkerError(format!(
            "assembled {} bytes, expected {}",
            content.len(),
            torrent.length
        )));
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

async fn run(args: Args) -> Result<(), ApplicationError> {
    let torrent = Torrent::from_file(&args.torrent)?;
    torrent.log_info();

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(&torrent.name)));

    let peers = Tracker::new()?.announce(&torrent, args.port).await?;
    if peers.is_empty() {
        return Err(ApplicationError::TrackerError("no peers".into()));
    }

    let outcome = Downloader::new(torrent.clone(), peers, Config::default())
        .start()
        .await?;

    match outcome {
        Outcome::Complete(results) => {
            let content = assemble(results);
            write_output(&output, &torrent, &content).await?;
            info!("saved to {}", output.display());
            Ok(())
        }
        Outcome::Failed => Err(ApplicationError::WorkerError(
            "every peer connection failed before the download completed".into(),
        )),
    }
}

#[tokio::main]
async fn main() {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();

    let args = Args::parse();

    if let Err(error) = run(args).await {
        error!("{}", error);
        std::process::exit(1);
    }
}
