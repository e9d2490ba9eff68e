//! In-memory chunk buffers and the process-wide chunk store.

use bytes::Bytes;
use uuid::Uuid;

use crate::config::CHUNK_SIZE;
use crate::error::TransferError;
use crate::protocol::FileDescriptor;

/// Splits a payload into fixed-size chunks in strict ascending order.
/// The last chunk may be shorter; an empty payload yields no chunks.
pub fn split_chunks(data: &Bytes) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(data.len().div_ceil(CHUNK_SIZE));
    let mut offset = 0;
    while offset < data.len() {
        let end = usize::min(offset + CHUNK_SIZE, data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    chunks
}

/// The fully-populated chunk array of a file being sent.
/// Read-only for the duration of the transfer.
#[derive(Debug, Clone)]
pub struct OutboundChunkSet {
    pub id: Uuid,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunks: Vec<Bytes>,
}

impl OutboundChunkSet {
    pub fn chunk(&self, chunk_no: u32) -> Option<&Bytes> {
        self.chunks.get(chunk_no as usize)
    }
}

/// The sparsely-filled chunk array of a file being received,
/// pre-sized to `total_chunks` slots.
#[derive(Debug, Clone)]
pub struct InboundChunkSet {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunks: Vec<Option<Bytes>>,
}

impl InboundChunkSet {
    pub fn from_descriptor(descriptor: &FileDescriptor) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            size: descriptor.size,
            mime_type: descriptor.mime_type.clone(),
            total_chunks: descriptor.total_chunks,
            chunks: vec![None; descriptor.total_chunks as usize],
        }
    }

    /// Stores chunk `chunk_no`, rejecting indexes past the announced count.
    pub fn store(&mut self, chunk_no: u32, data: Bytes) -> Result<(), TransferError> {
        let slot = self
            .chunks
            .get_mut(chunk_no as usize)
            .ok_or_else(|| TransferError::ProtocolError(format!("chunk {chunk_no} out of range")))?;
        *slot = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }
}

/// At most one outbound and at most one inbound chunk set exist at a time.
/// The invariant is enforced here, at the point of creation, rather than
/// assumed by callers.
#[derive(Debug, Default)]
pub struct ChunkStore {
    outbound: Option<OutboundChunkSet>,
    inbound: Option<InboundChunkSet>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outbound(&mut self, set: OutboundChunkSet) -> Result<(), TransferError> {
        if self.outbound.is_some() {
            return Err(TransferError::TransferBusy);
        }
        self.outbound = Some(set);
        Ok(())
    }

    pub fn set_inbound(&mut self, set: InboundChunkSet) -> Result<(), TransferError> {
        if self.inbound.is_some() {
            return Err(TransferError::TransferBusy);
        }
        self.inbound = Some(set);
        Ok(())
    }

    pub fn outbound(&self) -> Option<&OutboundChunkSet> {
        self.outbound.as_ref()
    }

    pub fn inbound(&self) -> Option<&InboundChunkSet> {
        self.inbound.as_ref()
    }

    pub fn inbound_mut(&mut self) -> Option<&mut InboundChunkSet> {
        self.inbound.as_mut()
    }

    pub fn clear_outbound(&mut self) -> Option<OutboundChunkSet> {
        self.outbound.take()
    }

    pub fn take_inbound(&mut self) -> Option<InboundChunkSet> {
        self.inbound.take()
    }

    pub fn clear(&mut self) {
        self.outbound = None;
        self.inbound = None;
    }
}

/// History entry for a sent or received file. `available` flips to true when
/// the final chunk acknowledgment lands (sender) or the file is written to
/// disk (receiver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub uri: Option<String>,
    pub available: bool,
}

impl TransferRecord {
    pub fn from_descriptor(descriptor: &FileDescriptor, uri: Option<String>) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            size: descriptor.size,
            mime_type: descriptor.mime_type.clone(),
            uri,
            available: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(total_chunks: u32) -> FileDescriptor {
        FileDescriptor {
            id: Uuid::new_v4(),
            name: "doc.pdf".to_string(),
            size: 20_000,
            mime_type: "application/pdf".to_string(),
            total_chunks,
        }
    }

    #[test]
    fn test_split_chunk_lengths() {
        let data = Bytes::from(vec![0xAB; 20_000]);
        let chunks = split_chunks(&data);
        let lengths: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lengths, vec![8192, 8192, 3616]);
    }

    #[test]
    fn test_split_exact_multiple() {
        let data = Bytes::from(vec![0u8; CHUNK_SIZE * 2]);
        let chunks = split_chunks(&data);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == CHUNK_SIZE));
    }

    #[test]
    fn test_split_empty_payload() {
        assert!(split_chunks(&Bytes::new()).is_empty());
    }

    #[test]
    fn test_split_concat_roundtrip() {
        let data = Bytes::from((0..=255u8).cycle().take(30_000).collect::<Vec<_>>());
        let chunks = split_chunks(&data);

        let mut rebuilt = Vec::with_capacity(data.len());
        for chunk in &chunks {
            rebuilt.extend_from_slice(chunk);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_store_single_flight_outbound() {
        let mut store = ChunkStore::new();
        let set = OutboundChunkSet {
            id: Uuid::new_v4(),
            size: 10,
            mime_type: "text/plain".to_string(),
            total_chunks: 1,
            chunks: vec![Bytes::from_static(b"0123456789")],
        };
        store.set_outbound(set.clone()).unwrap();

        let second = OutboundChunkSet {
            id: Uuid::new_v4(),
            ..set.clone()
        };
        assert!(matches!(
            store.set_outbound(second),
            Err(TransferError::TransferBusy)
        ));
        // Original set untouched.
        assert_eq!(store.outbound().unwrap().id, set.id);
    }

    #[test]
    fn test_store_single_flight_inbound() {
        let mut store = ChunkStore::new();
        store
            .set_inbound(InboundChunkSet::from_descriptor(&descriptor(3)))
            .unwrap();
        assert!(matches!(
            store.set_inbound(InboundChunkSet::from_descriptor(&descriptor(3))),
            Err(TransferError::TransferBusy)
        ));
    }

    #[test]
    fn test_directions_are_independent() {
        let mut store = ChunkStore::new();
        store
            .set_inbound(InboundChunkSet::from_descriptor(&descriptor(2)))
            .unwrap();
        store
            .set_outbound(OutboundChunkSet {
                id: Uuid::new_v4(),
                size: 1,
                mime_type: "text/plain".to_string(),
                total_chunks: 1,
                chunks: vec![Bytes::from_static(b"x")],
            })
            .unwrap();
        assert!(store.inbound().is_some());
        assert!(store.outbound().is_some());
    }

    #[test]
    fn test_inbound_completeness() {
        let mut set = InboundChunkSet::from_descriptor(&descriptor(2));
        assert!(!set.is_complete());
        set.store(1, Bytes::from_static(b"b")).unwrap();
        assert!(!set.is_complete());
        set.store(0, Bytes::from_static(b"a")).unwrap();
        assert!(set.is_complete());
    }

    #[test]
    fn test_inbound_out_of_range_rejected() {
        let mut set = InboundChunkSet::from_descriptor(&descriptor(2));
        assert!(set.store(2, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_clear_resets_both_directions() {
        let mut store = ChunkStore::new();
        store
            .set_inbound(InboundChunkSet::from_descriptor(&descriptor(1)))
            .unwrap();
        store.clear();
        assert!(store.inbound().is_none());
        assert!(store.outbound().is_none());
    }
}
