//! Connection manager.
//!
//! A single actor task owns the TLS listener and/or dialer, the one live
//! [`PeerSession`], and all transfer state. Socket messages, pacing timers
//! and collaborator commands all re-enter the actor through one event
//! channel, so every ChunkStore and session mutation is serialized without
//! explicit locking. Observable state is published through a `watch`
//! channel as [`SessionSnapshot`] values.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunks::TransferRecord;
use crate::config::CHUNK_PACING;
use crate::discovery::PeerAnnouncement;
use crate::error::TransferError;
use crate::protocol::{MessageDecoder, WireMessage};
use crate::storage::{FsStorage, Storage};
use crate::transfer::{Action, FileKind, TransferState};
use crate::{assemble, tls};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Observable session state for the UI/CLI collaborator.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub is_connected: bool,
    pub connected_device_name: Option<String>,
    pub sent_files: Vec<TransferRecord>,
    pub received_files: Vec<TransferRecord>,
    pub total_sent_bytes: u64,
    pub total_received_bytes: u64,
}

#[derive(Debug)]
enum Event {
    // Collaborator commands.
    StartListening { port: u16 },
    Connect { host: String, port: u16, device_name: String },
    SendFile { path: PathBuf, mime_type: Option<String>, kind: FileKind },
    Disconnect,
    // Internal events re-entering the actor.
    PeerAccepted { stream: Box<TlsStream<TcpStream>> },
    DialSucceeded { stream: Box<TlsStream<TcpStream>>, device_name: String },
    FileLoaded { name: String, mime_type: Option<String>, kind: FileKind, data: Bytes, uri: String },
    Inbound(WireMessage),
    PacedSend(WireMessage),
    FileAssembled { id: Uuid, path: PathBuf },
    PeerClosed,
}

/// Settings for one connection manager instance.
pub struct ManagerConfig {
    pub device_name: String,
    pub output_dir: PathBuf,
    pub storage: Arc<dyn Storage>,
}

impl ManagerConfig {
    pub fn new(device_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_name: device_name.into(),
            output_dir: output_dir.into(),
            storage: Arc::new(FsStorage),
        }
    }
}

/// Cloneable handle to the connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Event>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl ConnectionHandle {
    /// Starts listening for a peer. Idempotent: a second call while a
    /// listener is active logs and returns without effect.
    pub async fn start_listening(&self, port: u16) {
        let _ = self.tx.send(Event::StartListening { port }).await;
    }

    /// Dials a peer found via discovery or a scanned QR code.
    pub async fn connect(&self, host: impl Into<String>, port: u16, device_name: impl Into<String>) {
        let _ = self
            .tx
            .send(Event::Connect {
                host: host.into(),
                port,
                device_name: device_name.into(),
            })
            .await;
    }

    pub async fn connect_to(&self, peer: &PeerAnnouncement) {
        self.connect(peer.host.to_string(), peer.port, peer.device_name.clone())
            .await;
    }

    /// Queues a file for sending over the active connection.
    pub async fn send_file(&self, path: impl Into<PathBuf>, mime_type: Option<String>, kind: FileKind) {
        let _ = self
            .tx
            .send(Event::SendFile {
                path: path.into(),
                mime_type,
                kind,
            })
            .await;
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(Event::Disconnect).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Spawns the connection actor and returns its handle.
pub fn spawn(config: ManagerConfig) -> ConnectionHandle {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let actor = ConnectionActor {
        device_name: config.device_name,
        output_dir: config.output_dir,
        storage: config.storage,
        transfer: TransferState::new(),
        session: None,
        listener: None,
        event_tx: tx.clone(),
        snapshot_tx,
    };
    tokio::spawn(actor.run(rx));

    ConnectionHandle { tx, snapshot_rx }
}

struct PeerSession {
    device_name: Option<String>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    reader_task: JoinHandle<()>,
}

struct ConnectionActor {
    device_name: String,
    output_dir: PathBuf,
    storage: Arc<dyn Storage>,
    transfer: TransferState,
    session: Option<PeerSession>,
    listener: Option<JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl ConnectionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
            self.publish();
        }
        // All handles dropped: tear everything down.
        self.disconnect().await;
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::StartListening { port } => self.start_listening(port).await,
            Event::Connect {
                host,
                port,
                device_name,
            } => self.dial(host, port, device_name),
            Event::SendFile {
                path,
                mime_type,
                kind,
            } => self.load_file(path, mime_type, kind),
            Event::Disconnect => self.disconnect().await,
            Event::PeerAccepted { stream } => self.adopt_peer(*stream, None),
            Event::DialSucceeded {
                stream,
                device_name,
            } => {
                self.adopt_peer(*stream, Some(device_name));
                // Announce our display name right after the handshake.
                let hello = WireMessage::Connect {
                    device_name: self.device_name.clone(),
                };
                self.write(hello).await;
            }
            Event::FileLoaded {
                name,
                mime_type,
                kind,
                data,
                uri,
            } => {
                match self
                    .transfer
                    .send_file(&name, mime_type.as_deref(), kind, data, Some(uri))
                {
                    Ok(action) => self.execute(action).await,
                    Err(e) => warn!(error = %e, "send rejected"),
                }
            }
            Event::Inbound(message) => self.on_message(message).await,
            Event::PacedSend(message) => self.write(message).await,
            Event::FileAssembled { id, path } => {
                self.transfer
                    .mark_received_available(id, path.display().to_string());
            }
            Event::PeerClosed => self.disconnect().await,
        }
    }

    async fn on_message(&mut self, message: WireMessage) {
        let action = match message {
            WireMessage::Connect { device_name } => {
                info!(peer = %device_name, "peer announced itself");
                if let Some(session) = self.session.as_mut() {
                    session.device_name = Some(device_name);
                }
                None
            }
            WireMessage::FileAck { file } => self.transfer.on_file_ack(&file),
            WireMessage::SendChunkAck { chunk_no } => self.transfer.on_send_chunk_ack(chunk_no),
            WireMessage::ReceiveChunkAck { chunk, chunk_no } => {
                self.transfer.on_receive_chunk_ack(&chunk, chunk_no)
            }
        };
        if let Some(action) = action {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Send(message) => self.write(message).await,
            Action::SendPaced(message) => {
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(CHUNK_PACING).await;
                    let _ = tx.send(Event::PacedSend(message)).await;
                });
            }
            Action::Assemble(set) => {
                let id = set.id;
                let storage = Arc::clone(&self.storage);
                let output_dir = self.output_dir.clone();
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    match assemble::assemble(set, storage.as_ref(), &output_dir).await {
                        Ok(path) => {
                            let _ = tx.send(Event::FileAssembled { id, path }).await;
                        }
                        // Assembly failure does not block the next transfer;
                        // the inbound set is already cleared.
                        Err(e) => error!(error = %e, "file assembly failed"),
                    }
                });
            }
        }
    }

    /// Writes one message as a single JSON object. Any socket error
    /// escalates to a full disconnect.
    async fn write(&mut self, message: WireMessage) {
        let Some(session) = self.session.as_mut() else {
            debug!("dropping outbound message, no active session");
            return;
        };
        let result = async {
            let bytes = message.encode()?;
            session.writer.write_all(&bytes).await?;
            session.writer.flush().await?;
            Ok::<_, TransferError>(())
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "socket write failed");
            self.disconnect().await;
        }
    }

    async fn start_listening(&mut self, port: u16) {
        if self.listener.is_some() {
            info!("listener already active");
            return;
        }
        let acceptor = match tls::acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!(error = %e, "failed to build TLS acceptor");
                return;
            }
        };
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "failed to bind listener");
                return;
            }
        };
        info!(port, "listening for a peer");

        let tx = self.event_tx.clone();
        self.listener = Some(tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!(%peer_addr, "peer connected");
                        if tx
                            .send(Event::PeerAccepted {
                                stream: Box::new(TlsStream::Server(tls_stream)),
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => warn!(%peer_addr, error = %e, "TLS handshake failed"),
                }
            }
        }));
    }

    fn dial(&mut self, host: String, port: u16, device_name: String) {
        if self.session.is_some() {
            warn!("already connected to a peer, ignoring connect request");
            return;
        }
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let tcp = TcpStream::connect((host.as_str(), port)).await?;
                tcp.set_nodelay(true)?;
                let connector = tls::connector()?;
                let stream = connector.connect(tls::server_name()?, tcp).await?;
                Ok::<_, TransferError>(stream)
            }
            .await;

            match result {
                Ok(stream) => {
                    let _ = tx
                        .send(Event::DialSucceeded {
                            stream: Box::new(TlsStream::Client(stream)),
                            device_name,
                        })
                        .await;
                }
                // No automatic reconnect; the device stays disconnected.
                Err(e) => error!(%host, port, error = %e, "connect failed"),
            }
        });
    }

    /// Installs the freshly-handshaken stream as the one active session.
    fn adopt_peer(&mut self, stream: TlsStream<TcpStream>, device_name: Option<String>) {
        if self.session.is_some() {
            warn!("a peer is already connected, dropping new connection");
            return;
        }
        let (reader, writer) = split(stream);
        let reader_task = tokio::spawn(read_loop(reader, self.event_tx.clone()));
        self.session = Some(PeerSession {
            device_name,
            writer,
            reader_task,
        });
    }

    fn load_file(&mut self, path: PathBuf, mime_type: Option<String>, kind: FileKind) {
        if self.session.is_none() {
            warn!("cannot send file, not connected");
            return;
        }
        if self.transfer.store().outbound().is_some() {
            warn!("{}", TransferError::TransferBusy);
            return;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let uri = path.display().to_string();
        let storage = Arc::clone(&self.storage);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            match storage.read_file(&path).await {
                Ok(data) => {
                    let _ = tx
                        .send(Event::FileLoaded {
                            name,
                            mime_type,
                            kind,
                            data,
                            uri,
                        })
                        .await;
                }
                // Send attempt is abandoned; the connection stays up.
                Err(e) => error!(path = %path.display(), error = %e, "failed to read file"),
            }
        });
    }

    /// Tears down sockets and transfer state. Safe to call repeatedly and
    /// from either side of the connection.
    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.reader_task.abort();
            let mut writer = session.writer;
            let _ = writer.shutdown().await;
            info!("disconnected from peer");
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.transfer.reset();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            is_connected: self.session.is_some(),
            connected_device_name: self
                .session
                .as_ref()
                .and_then(|s| s.device_name.clone()),
            sent_files: self.transfer.sent_files.clone(),
            received_files: self.transfer.received_files.clone(),
            total_sent_bytes: self.transfer.total_sent_bytes,
            total_received_bytes: self.transfer.total_received_bytes,
        });
    }
}

async fn read_loop(
    mut reader: tokio::io::ReadHalf<TlsStream<TcpStream>>,
    tx: mpsc::Sender<Event>,
) {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("peer closed the connection");
                let _ = tx.send(Event::PeerClosed).await;
                break;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => {
                            if tx.send(Event::Inbound(message)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        // Malformed payload: drop it, keep the connection.
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable message");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "socket read failed");
                let _ = tx.send(Event::PeerClosed).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_until<F>(handle: &ConnectionHandle, mut pred: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let snapshot = handle.snapshot();
                if pred(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }

    async fn paired_session(
        port: u16,
        receiver_out: &std::path::Path,
        sender_out: &std::path::Path,
    ) -> (ConnectionHandle, ConnectionHandle) {
        let receiver = spawn(ManagerConfig::new("Receiver", receiver_out));
        receiver.start_listening(port).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sender = spawn(ManagerConfig::new("Sender", sender_out));
        sender.connect("127.0.0.1", port, "Receiver").await;

        wait_until(&sender, |s| s.is_connected).await;
        wait_until(&receiver, |s| {
            s.is_connected && s.connected_device_name.as_deref() == Some("Sender")
        })
        .await;
        (receiver, sender)
    }

    #[tokio::test]
    async fn test_loopback_transfer_end_to_end() {
        let recv_dir = TempDir::new().unwrap();
        let send_dir = TempDir::new().unwrap();
        let (receiver, sender) =
            paired_session(free_port(), recv_dir.path(), send_dir.path()).await;

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let source = send_dir.path().join("photo.jpg");
        tokio::fs::write(&source, &payload).await.unwrap();

        sender
            .send_file(&source, Some("image/jpeg".to_string()), FileKind::Image)
            .await;

        let received = wait_until(&receiver, |s| {
            s.received_files.iter().any(|r| r.available)
        })
        .await;
        let record = &received.received_files[0];
        assert_eq!(record.name, "photo.jpg");
        assert_eq!(record.size, 20_000);
        assert_eq!(record.mime_type, "image/jpeg");
        assert_eq!(received.total_received_bytes, 20_000);

        let saved = recv_dir.path().join("photo.jpg");
        assert_eq!(tokio::fs::read(&saved).await.unwrap(), payload);

        let sent = wait_until(&sender, |s| s.sent_files.iter().any(|r| r.available)).await;
        assert_eq!(sent.total_sent_bytes, 20_000);
        assert_eq!(sent.sent_files[0].uri.as_deref(), Some(source.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_sequential_transfers_on_one_connection() {
        let recv_dir = TempDir::new().unwrap();
        let send_dir = TempDir::new().unwrap();
        let (receiver, sender) =
            paired_session(free_port(), recv_dir.path(), send_dir.path()).await;

        for (name, contents) in [("first.txt", "hello"), ("second.txt", "world!")] {
            let source = send_dir.path().join(name);
            tokio::fs::write(&source, contents).await.unwrap();
            sender.send_file(&source, None, FileKind::File).await;
            wait_until(&receiver, |s| {
                s.received_files.iter().any(|r| r.name == name && r.available)
            })
            .await;
        }

        let snapshot = receiver.snapshot();
        assert_eq!(snapshot.received_files.len(), 2);
        assert_eq!(snapshot.total_received_bytes, 11);
        assert_eq!(
            tokio::fs::read_to_string(recv_dir.path().join("second.txt"))
                .await
                .unwrap(),
            "world!"
        );
    }

    #[tokio::test]
    async fn test_disconnect_resets_both_sides() {
        let recv_dir = TempDir::new().unwrap();
        let send_dir = TempDir::new().unwrap();
        let (receiver, sender) =
            paired_session(free_port(), recv_dir.path(), send_dir.path()).await;

        let source = send_dir.path().join("note.txt");
        tokio::fs::write(&source, "bye").await.unwrap();
        sender.send_file(&source, None, FileKind::File).await;
        wait_until(&receiver, |s| s.received_files.iter().any(|r| r.available)).await;

        sender.disconnect().await;
        let sender_after = wait_until(&sender, |s| !s.is_connected).await;
        let receiver_after = wait_until(&receiver, |s| !s.is_connected).await;

        assert!(sender_after.sent_files.is_empty());
        assert_eq!(sender_after.total_sent_bytes, 0);
        assert!(receiver_after.received_files.is_empty());
        assert_eq!(receiver_after.total_received_bytes, 0);
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_disconnected() {
        let dir = TempDir::new().unwrap();
        let handle = spawn(ManagerConfig::new("TestDevice", dir.path()));

        let snapshot = handle.snapshot();
        assert!(!snapshot.is_connected);
        assert!(snapshot.connected_device_name.is_none());
        assert!(snapshot.sent_files.is_empty());
        assert_eq!(snapshot.total_sent_bytes, 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_safe() {
        let dir = TempDir::new().unwrap();
        let handle = spawn(ManagerConfig::new("TestDevice", dir.path()));

        handle.disconnect().await;
        handle.disconnect().await;
        tokio::task::yield_now().await;
        assert!(!handle.snapshot().is_connected);
    }

    #[tokio::test]
    async fn test_send_file_without_session_is_dropped() {
        let dir = TempDir::new().unwrap();
        let handle = spawn(ManagerConfig::new("TestDevice", dir.path()));

        handle
            .send_file(dir.path().join("missing.bin"), None, FileKind::File)
            .await;
        tokio::task::yield_now().await;
        assert!(handle.snapshot().sent_files.is_empty());
    }
}
