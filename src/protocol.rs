//! Wire protocol for the paired connection.
//!
//! Every message is a single JSON object written in one piece to the TLS
//! stream, with no length prefix and no newline separator. The decoder
//! therefore accumulates raw bytes and pulls complete JSON values off the
//! front of the buffer, tolerating writes that arrive coalesced or split.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransferError;

/// Metadata announced ahead of any chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
}

/// The four protocol events, tagged by the `event` field on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireMessage {
    /// Announce the local display name right after the TLS handshake.
    Connect {
        #[serde(rename = "deviceName")]
        device_name: String,
    },
    /// Announce an incoming file. Carries metadata only, never bytes.
    FileAck { file: FileDescriptor },
    /// "Send me chunk N."
    SendChunkAck {
        #[serde(rename = "chunkNo")]
        chunk_no: u32,
    },
    /// Chunk N payload, base64-encoded.
    ReceiveChunkAck {
        chunk: String,
        #[serde(rename = "chunkNo")]
        chunk_no: u32,
    },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Incremental decoder over an unframed stream of JSON objects.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pulls the next complete message off the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete value yet. A
    /// malformed payload yields a `Serialization` error and discards the
    /// buffered bytes so a later write can resynchronize; the connection
    /// itself is left up (the caller logs and drops the message).
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, TransferError> {
        while let Some(&b) = self.buf.first() {
            if b.is_ascii_whitespace() {
                self.buf.advance(1);
            } else {
                break;
            }
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<WireMessage>();
        match iter.next() {
            Some(Ok(message)) => {
                let consumed = iter.byte_offset();
                self.buf.advance(consumed);
                Ok(Some(message))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.buf.clear();
                Err(TransferError::Serialization(e))
            }
            None => Ok(None),
        }
    }
}
