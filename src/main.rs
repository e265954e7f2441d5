use anyhow::Context;
use clap::Parser;
use crossbeam::channel;
use log::{error, info, warn};
use minnow::peer::manager::{Outcome, PeerManager};
use minnow::storage::PieceStore;
use minnow::torrent::Torrent;
use minnow::tracker::client::{self, Announce, Stats, Tracker};
use minnow::utils;
use rand::Rng;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

#[derive(Parser, Debug)]
#[command(name = "minnow", about = "a small single-file BitTorrent client")]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,
    /// TCP port reported to the tracker (random 10000-20000 by default)
    #[arg(long)]
    listen_port: Option<u16>,
    /// Peer connections held open at once
    #[arg(long, default_value_t = minnow::MAX_CONNECTIONS)]
    max_connections: usize,
    /// Output path; defaults to the torrent's `name`
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(Outcome::Complete) => ExitCode::SUCCESS,
        Ok(Outcome::Stopped) => ExitCode::from(2),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<Outcome> {
    let torrent = Torrent::from_file(&cli.torrent).context("loading torrent")?;
    info!(
        "{}: {} bytes, {} pieces of {}",
        torrent.name,
        torrent.total_length,
        torrent.num_pieces(),
        torrent.piece_length
    );

    let output = cli.output.unwrap_or_else(|| PathBuf::from(&torrent.name));
    let store = PieceStore::create(&torrent, &output)
        .with_context(|| format!("opening {}", output.display()))?;

    let peer_id = utils::generate_peer_id();
    let port = cli.listen_port.unwrap_or_else(utils::random_listen_port);
    let stats = Arc::new(Stats::default());
    stats.left.store(store.left(), Ordering::Relaxed);
    let base = Announce {
        info_hash: torrent.info_hash,
        peer_id,
        port,
        uploaded: 0,
        downloaded: 0,
        left: 0,
        numwant: None,
        key: rand::thread_rng().gen(),
        ip: None,
    };
    let tracker = Tracker::from_url(&torrent.announce).context("announce url")?;

    let (peers_tx, peers_rx) = channel::unbounded();
    let mut manager = PeerManager::new(
        store,
        torrent.info_hash,
        peer_id,
        cli.max_connections,
        peers_rx,
    )?;
    let stop = manager.stop_handle();

    let tracker_stats = stats.clone();
    let tracker_stop = stop.clone();
    let tracker_thread =
        thread::spawn(move || client::run(tracker, base, tracker_stats, peers_tx, tracker_stop));

    let outcome = manager.run(&stats);

    // swarm is done either way; let the tracker thread say goodbye
    stop.store(true, Ordering::Relaxed);
    if tracker_thread.join().is_err() {
        warn!("tracker thread panicked");
    }
    outcome
}
