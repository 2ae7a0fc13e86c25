//! bt-fetch - Main entry point
//!
//! Thin drivers over the library: codec inspection, torrent and magnet
//! metadata, tracker discovery, handshakes and downloads.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use bt_fetch::{
    bencode, discover_peers, CliArgs, Command, Config, DownloadManager, MagnetInfo, MagnetParser,
    PeerConnection, ProgressDisplay, TorrentError, TorrentInfo, TorrentParser, Value,
};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }

        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    setup_panic_handler();
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Invalid configuration")?;
    run(args.command, &config).await
}

async fn run(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Decode { value } => {
            let decoded = bencode::decode_all(value.as_bytes())?;
            println!("{}", serde_json::to_string(&decoded)?);
        }
        Command::Encode { json } => {
            let json: serde_json::Value = serde_json::from_str(&json).map_err(TorrentError::from)?;
            let encoded = bencode::encode(&Value::try_from(json)?);
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&encoded)?;
            stdout.flush()?;
        }
        Command::Info { torrent } => {
            let info = load_torrent(&torrent)?;
            print_info(&info);
        }
        Command::Peers { torrent } => {
            let info = load_torrent(&torrent)?;
            for peer in discover_peers(&info.announce, info.info_hash, info.length, config).await? {
                println!("{}", peer);
            }
        }
        Command::Handshake { torrent, peer } => {
            let info = load_torrent(&torrent)?;
            let addr: SocketAddr = peer.parse().map_err(TorrentError::from)?;

            let mut conn = PeerConnection::connect(addr, config).await?;
            let theirs = conn.handshake(info.info_hash, config.peer_id, false).await?;
            println!("Peer ID: {}", hex::encode(theirs.peer_id));
        }
        Command::DownloadPiece { output, torrent, index } => {
            let info = load_torrent(&torrent)?;
            let peers = discover_peers(&info.announce, info.info_hash, info.length, config).await?;
            download_piece(info, &peers, index, &output, config).await?;
        }
        Command::Download { output, torrent } => {
            let info = load_torrent(&torrent)?;
            let peers = discover_peers(&info.announce, info.info_hash, info.length, config).await?;
            download(info, &peers, &output, config).await?;
            println!("Downloaded {} to {}.", torrent.display(), output.display());
        }
        Command::MagnetParse { magnet } => {
            let magnet = MagnetParser::parse(&magnet)?;
            println!("Tracker URL: {}", magnet.announce().unwrap_or("-"));
            println!("Info Hash: {}", magnet.info_hash_hex());
        }
        Command::MagnetHandshake { magnet } => {
            let magnet = MagnetParser::parse(&magnet)?;
            let peers = magnet_peers(&magnet, config).await?;
            let addr = peers[0];

            let mut conn = PeerConnection::connect(addr, config).await?;
            let theirs = conn.metadata_handshake(magnet.info_hash, config.peer_id).await?;
            if let Some(peer_id) = conn.peer.peer_id {
                println!("Peer ID: {}", hex::encode(peer_id));
            }
            match theirs.ut_metadata_id() {
                Some(id) => println!("Peer Metadata Extension ID: {}", id),
                None => println!("Peer Metadata Extension ID: none"),
            }
        }
        Command::MagnetInfo { magnet } => {
            let magnet = MagnetParser::parse(&magnet)?;
            let peers = magnet_peers(&magnet, config).await?;
            let info = fetch_metadata(&magnet, &peers, config).await?;
            print_info(&info);
        }
        Command::MagnetDownloadPiece { output, magnet, index } => {
            let magnet = MagnetParser::parse(&magnet)?;
            let peers = magnet_peers(&magnet, config).await?;
            let info = fetch_metadata(&magnet, &peers, config).await?;
            download_piece(info, &peers, index, &output, config).await?;
        }
        Command::MagnetDownload { output, magnet } => {
            let magnet = MagnetParser::parse(&magnet)?;
            let peers = magnet_peers(&magnet, config).await?;
            let info = fetch_metadata(&magnet, &peers, config).await?;
            let name = info.name.clone();
            download(info, &peers, &output, config).await?;
            println!("Downloaded {} to {}.", name, output.display());
        }
    }

    Ok(())
}

/// Load and parse the torrent file
fn load_torrent(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    TorrentParser::parse_file(path).with_context(|| format!("Failed to load torrent file {}", path.display()))
}

fn print_info(info: &TorrentInfo) {
    println!("Tracker URL: {}", info.announce);
    println!("Length: {}", info.length);
    println!("Info Hash: {}", info.info_hash_hex());
    println!("Piece Length: {}", info.piece_length);
    println!("Piece Hashes:");
    for hash in info.piece_hashes_hex() {
        println!("{}", hash);
    }
}

/// Peers for a magnet link; the size is unknown so `left` is 1
async fn magnet_peers(magnet: &MagnetInfo, config: &Config) -> Result<Vec<SocketAddr>> {
    let announce = magnet
        .announce()
        .ok_or_else(|| TorrentError::metadata_error_with_field("Magnet link has no tracker", "tr"))?;
    discover_peers(announce, magnet.info_hash, 1, config).await
}

/// Fetch the info dictionary from the first peer that serves it
async fn fetch_metadata(magnet: &MagnetInfo, peers: &[SocketAddr], config: &Config) -> Result<TorrentInfo> {
    let announce = magnet.announce().unwrap_or_default();
    let mut last_error = None;

    for &addr in peers {
        let attempt = async {
            let mut conn = PeerConnection::connect(addr, config).await?;
            conn.metadata_handshake(magnet.info_hash, config.peer_id).await?;
            let metadata = conn.fetch_metadata(magnet.info_hash).await?;
            if let Err(e) = conn.close().await {
                debug!("Closing {}: {}", addr, e);
            }
            TorrentInfo::from_metadata(announce, &metadata)
        };

        match attempt.await {
            Ok(info) => return Ok(info),
            Err(e) => {
                warn!("Metadata fetch from {} failed: {:#}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TorrentError::discovery_error("No peers available").into()))
}

async fn download_piece(info: TorrentInfo, peers: &[SocketAddr], index: u32, output: &Path, config: &Config) -> Result<()> {
    let manager = DownloadManager::new(info, config.clone());
    let data = manager.download_piece(peers, index as usize).await?;

    tokio::fs::write(output, &data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Piece {} downloaded to {}.", index, output.display());
    Ok(())
}

async fn download(info: TorrentInfo, peers: &[SocketAddr], output: &Path, config: &Config) -> Result<()> {
    let manager = DownloadManager::new(info, config.clone());
    let mut progress = ProgressDisplay::new(config.quiet);
    let mut last = None;

    let data = manager
        .download(peers, |stats| {
            if let Err(e) = progress.update(stats) {
                debug!("Progress output failed: {}", e);
            }
            last = Some(stats.clone());
        })
        .await?;

    if let Some(stats) = &last {
        if let Err(e) = progress.finish(stats) {
            debug!("Progress output failed: {}", e);
        }
    }

    tokio::fs::write(output, &data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Wrote {} bytes to {}", data.len(), output.display());
    Ok(())
}
