//! Transfer protocol state machine.
//!
//! Interprets the four wire events and drives a strict stop-and-wait chunk
//! exchange: exactly one chunk is in flight per direction, the next chunk is
//! requested only after the previous one was processed. There is no
//! pipelining and no retransmission; a lost message stalls the transfer
//! until disconnect.
//!
//! Handlers mutate the state and return the follow-up [`Action`] for the
//! connection actor to execute. Sequencing conflicts and decode failures are
//! logged and dropped here, never escalated to a disconnect.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunks::{
    split_chunks, ChunkStore, InboundChunkSet, OutboundChunkSet, TransferRecord,
};
use crate::error::TransferError;
use crate::protocol::{FileDescriptor, WireMessage};

/// Kind hint supplied by the file-picking collaborator. Only used to pick a
/// fallback MIME type; no content sniffing happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Image,
}

impl FileKind {
    fn fallback_mime(self) -> &'static str {
        match self {
            FileKind::File => "application/octet-stream",
            FileKind::Image => "image/jpeg",
        }
    }
}

/// Per-direction transfer phase. The reference tracked this implicitly by
/// chunk-set presence; here it is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionState {
    #[default]
    Idle,
    FileAnnounced,
    Transferring,
    Complete,
}

/// Follow-up work the connection actor performs after a handler runs.
#[derive(Debug)]
pub enum Action {
    /// Write the message immediately.
    Send(WireMessage),
    /// Write the message after the fixed pacing delay.
    SendPaced(WireMessage),
    /// The inbound set is complete; reassemble and persist it.
    Assemble(InboundChunkSet),
}

/// All mutable transfer state. Owned exclusively by the connection actor
/// task, which serializes every mutation.
#[derive(Debug, Default)]
pub struct TransferState {
    store: ChunkStore,
    pub sent_files: Vec<TransferRecord>,
    pub received_files: Vec<TransferRecord>,
    pub total_sent_bytes: u64,
    pub total_received_bytes: u64,
    pub outbound_state: DirectionState,
    pub inbound_state: DirectionState,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Initiates an outbound transfer: chunks the payload, records the
    /// descriptor and returns the `file_ack` announcement. Bytes are never
    /// sent until the peer asks for each chunk.
    pub fn send_file(
        &mut self,
        name: &str,
        mime_type: Option<&str>,
        kind: FileKind,
        data: Bytes,
        uri: Option<String>,
    ) -> Result<Action, TransferError> {
        if self.store.outbound().is_some() {
            return Err(TransferError::TransferBusy);
        }

        let chunks = split_chunks(&data);
        let descriptor = FileDescriptor {
            id: Uuid::new_v4(),
            name: name.to_string(),
            size: data.len() as u64,
            mime_type: mime_type.unwrap_or(kind.fallback_mime()).to_string(),
            total_chunks: chunks.len() as u32,
        };

        self.sent_files
            .push(TransferRecord::from_descriptor(&descriptor, uri));

        if descriptor.total_chunks == 0 {
            // Nothing for the peer to request; complete on the spot.
            self.mark_sent_available(descriptor.id);
            self.outbound_state = DirectionState::Complete;
        } else {
            self.store.set_outbound(OutboundChunkSet {
                id: descriptor.id,
                size: descriptor.size,
                mime_type: descriptor.mime_type.clone(),
                total_chunks: descriptor.total_chunks,
                chunks,
            })?;
            self.outbound_state = DirectionState::FileAnnounced;
        }

        info!(
            file = name,
            size = descriptor.size,
            total_chunks = descriptor.total_chunks,
            "announcing outbound file"
        );
        Ok(Action::Send(WireMessage::FileAck { file: descriptor }))
    }

    /// Peer announced an incoming file: allocate the inbound set and ask for
    /// chunk 0 after the pacing delay.
    pub fn on_file_ack(&mut self, descriptor: &FileDescriptor) -> Option<Action> {
        if self.store.inbound().is_some() {
            warn!(
                file = %descriptor.name,
                "rejecting file announcement, a file is still being received"
            );
            return None;
        }

        self.received_files
            .push(TransferRecord::from_descriptor(descriptor, None));

        let set = InboundChunkSet::from_descriptor(descriptor);
        if set.is_complete() {
            // Zero-chunk file: nothing to request.
            self.inbound_state = DirectionState::Complete;
            return Some(Action::Assemble(set));
        }

        // Ignore the set-while-busy error; the guard above makes it
        // unreachable on this path.
        self.store.set_inbound(set).ok()?;
        self.inbound_state = DirectionState::FileAnnounced;
        info!(
            file = %descriptor.name,
            total_chunks = descriptor.total_chunks,
            "incoming file announced, requesting chunk 0"
        );
        Some(Action::SendPaced(WireMessage::SendChunkAck { chunk_no: 0 }))
    }

    /// Peer asked for chunk N: emit it and apply the sender-side completion
    /// test. The `chunk_no + 2 > total_chunks` comparison is the reference
    /// behavior, kept literally; it marks the sender done while the final
    /// chunk is still on the wire.
    pub fn on_send_chunk_ack(&mut self, chunk_no: u32) -> Option<Action> {
        let Some(outbound) = self.store.outbound() else {
            warn!(chunk_no, "chunk requested but no outbound transfer exists");
            return None;
        };
        let Some(chunk) = outbound.chunk(chunk_no) else {
            warn!(
                chunk_no,
                total_chunks = outbound.total_chunks,
                "chunk request out of range, dropping"
            );
            return None;
        };

        let encoded = BASE64.encode(chunk);
        let chunk_len = chunk.len() as u64;
        let total_chunks = outbound.total_chunks;
        let id = outbound.id;

        self.total_sent_bytes += chunk_len;
        self.outbound_state = DirectionState::Transferring;
        debug!(chunk_no, bytes = chunk_len, "sending chunk");

        if chunk_no + 2 > total_chunks {
            self.mark_sent_available(id);
            self.store.clear_outbound();
            self.outbound_state = DirectionState::Complete;
            info!("all chunks sent, outbound transfer complete");
        }

        Some(Action::SendPaced(WireMessage::ReceiveChunkAck {
            chunk: encoded,
            chunk_no,
        }))
    }

    /// Chunk N arrived: store it and either request the next one or hand the
    /// completed set to the assembler. Malformed base64 and out-of-range
    /// indexes are logged and dropped.
    pub fn on_receive_chunk_ack(&mut self, chunk_b64: &str, chunk_no: u32) -> Option<Action> {
        if self.store.inbound().is_none() {
            debug!(chunk_no, "chunk arrived with no inbound transfer, ignoring");
            return None;
        }

        let data = match BASE64.decode(chunk_b64) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(chunk_no, error = %e, "malformed chunk payload, dropping");
                return None;
            }
        };

        let total_chunks = {
            let inbound = self.store.inbound_mut()?;
            if let Err(e) = inbound.store(chunk_no, data.clone()) {
                warn!(chunk_no, error = %e, "dropping chunk");
                return None;
            }
            inbound.total_chunks
        };

        self.total_received_bytes += data.len() as u64;
        self.inbound_state = DirectionState::Transferring;
        debug!(chunk_no, bytes = data.len(), "chunk received");

        if chunk_no + 1 == total_chunks {
            self.inbound_state = DirectionState::Complete;
            let set = self.store.take_inbound()?;
            info!("all chunks received, handing off to assembler");
            return Some(Action::Assemble(set));
        }

        Some(Action::SendPaced(WireMessage::SendChunkAck {
            chunk_no: chunk_no + 1,
        }))
    }

    /// Called by the actor once the assembler has written the file.
    pub fn mark_received_available(&mut self, id: Uuid, uri: String) {
        if let Some(record) = self
            .received_files
            .iter_mut()
            .find(|r| r.id == id && !r.available)
        {
            record.uri = Some(uri);
            record.available = true;
        }
    }

    fn mark_sent_available(&mut self, id: Uuid) {
        if let Some(record) = self
            .sent_files
            .iter_mut()
            .find(|r| r.id == id && !r.available)
        {
            record.available = true;
        }
    }

    /// Disconnect path: abandon any in-flight transfer in either direction
    /// and zero every counter. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.store.clear();
        self.sent_files.clear();
        self.received_files.clear();
        self.total_sent_bytes = 0;
        self.total_received_bytes = 0;
        self.outbound_state = DirectionState::Idle;
        self.inbound_state = DirectionState::Idle;
    }
}
