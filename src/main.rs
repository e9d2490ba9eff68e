use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lanbeam::config::Config;
use lanbeam::connection::{self, ConnectionHandle, ManagerConfig};
use lanbeam::discovery::{Broadcaster, Listener, PeerAnnouncement};
use lanbeam::transfer::FileKind;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML format)
    #[arg(short, long, default_value = "lanbeam.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for a peer: listen for connections and broadcast this device
    Receive {
        /// Listen port, overriding the configured one
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send a file to a peer
    Send {
        /// Path to the file to transfer
        #[arg(short, long)]
        file: PathBuf,
        /// Pairing payload (`tcp://<ip>:<port>|<name>`); discovered if omitted
        #[arg(short, long)]
        to: Option<String>,
        /// MIME type to announce; guessed from the kind if omitted
        #[arg(short, long)]
        mime: Option<String>,
        /// Announce the file as an image
        #[arg(long)]
        image: bool,
    },
    /// List devices announcing themselves on this network
    Discover,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_create(&cli.config)?;
    config.validate()?;

    match cli.command {
        Commands::Receive { port } => run_receive(config, port).await?,
        Commands::Send {
            file,
            to,
            mime,
            image,
        } => run_send(config, file, to, mime, image).await?,
        Commands::Discover => run_discover().await?,
    }

    Ok(())
}

async fn run_receive(config: Config, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or(config.device.listen_port);
    let handle = connection::spawn(ManagerConfig::new(
        config.device.name.clone(),
        &config.transfer.output_directory,
    ));
    handle.start_listening(port).await;

    let announcement = match lanbeam::discovery::local_ip().await {
        Ok(ip) => {
            let announcement = PeerAnnouncement::new(ip, port, &config.device.name);
            println!("Pairing payload: {}", announcement.payload());
            Some(announcement)
        }
        Err(e) => {
            warn!(error = %e, "could not determine local IP, discovery disabled");
            None
        }
    };
    let _broadcaster = match announcement {
        Some(announcement) => {
            Some(Broadcaster::start(announcement, config.broadcast_interval()).await?)
        }
        None => None,
    };

    info!(port, "waiting for a peer, press Ctrl-C to stop");
    let mut watch = handle.watch();
    let mut reported = 0usize;
    loop {
        tokio::select! {
            changed = watch.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = watch.borrow().clone();
                let saved: Vec<_> = snapshot
                    .received_files
                    .iter()
                    .filter(|r| r.uri.is_some())
                    .collect();
                for record in saved.iter().skip(reported) {
                    if let Some(uri) = &record.uri {
                        println!("Received {} ({} bytes) -> {}", record.name, record.size, uri);
                    }
                }
                reported = saved.len();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.disconnect().await;
                break;
            }
        }
    }
    Ok(())
}

async fn run_send(
    config: Config,
    file: PathBuf,
    to: Option<String>,
    mime: Option<String>,
    image: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let peer = match to {
        Some(payload) => PeerAnnouncement::parse(&payload)?,
        None => {
            info!("no target given, discovering peers");
            let (_listener, mut peers) = Listener::start().await?;
            match tokio::time::timeout(DISCOVER_TIMEOUT, peers.recv()).await {
                Ok(Some(peer)) => peer,
                _ => {
                    error!("no peer discovered");
                    return Err("no peer discovered".into());
                }
            }
        }
    };
    info!(device = %peer.device_name, host = %peer.host, port = peer.port, "connecting");

    let handle = connection::spawn(ManagerConfig::new(
        config.device.name.clone(),
        &config.transfer.output_directory,
    ));
    handle.connect_to(&peer).await;
    wait_for_connection(&handle).await?;

    let size = tokio::fs::metadata(&file).await?.len();
    let kind = if image { FileKind::Image } else { FileKind::File };
    handle.send_file(&file, mime, kind).await;

    let progress = config.transfer.enable_progress_bar.then(|| {
        let pb = ProgressBar::new(size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) ETA: {eta} - {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_message(format!("Sending: {}", file.display()));
        pb
    });

    let mut watch = handle.watch();
    loop {
        let (sent_bytes, done, connected) = {
            let snapshot = watch.borrow();
            (
                snapshot.total_sent_bytes,
                snapshot.sent_files.iter().any(|r| r.available),
                snapshot.is_connected,
            )
        };
        if let Some(pb) = &progress {
            pb.set_position(sent_bytes.min(size));
        }
        if done {
            if let Some(pb) = &progress {
                pb.finish_with_message("done");
            }
            info!(file = %file.display(), "transfer complete");
            break;
        }
        if !connected {
            if let Some(pb) = &progress {
                pb.abandon_with_message("disconnected");
            }
            return Err("peer disconnected before the transfer completed".into());
        }
        if watch.changed().await.is_err() {
            break;
        }
    }

    handle.disconnect().await;
    Ok(())
}

async fn wait_for_connection(handle: &ConnectionHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut watch = handle.watch();
    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            if watch.borrow().is_connected {
                return true;
            }
            if watch.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;
    match connected {
        Ok(true) => Ok(()),
        _ => Err("could not connect to peer".into()),
    }
}

async fn run_discover() -> Result<(), Box<dyn std::error::Error>> {
    let (_listener, mut peers) = Listener::start().await?;
    println!("Listening for devices, press Ctrl-C to stop");
    loop {
        tokio::select! {
            peer = peers.recv() => {
                match peer {
                    Some(peer) => {
                        println!("{}  tcp://{}:{}", peer.device_name, peer.host, peer.port)
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
