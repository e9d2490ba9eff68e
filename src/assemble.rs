//! Reassembles a completed inbound chunk set into a single file on disk.

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::{info, warn};

use crate::chunks::InboundChunkSet;
use crate::error::TransferError;
use crate::storage::Storage;

/// Concatenates the chunk array in index order and persists it under the
/// original file name inside `output_dir`. Every slot must be populated;
/// a gap fails the assembly without touching the disk.
pub async fn assemble(
    set: InboundChunkSet,
    storage: &dyn Storage,
    output_dir: &Path,
) -> Result<PathBuf, TransferError> {
    if let Some(missing) = set.chunks.iter().position(Option::is_none) {
        warn!(
            chunk_no = missing,
            file = %set.name,
            "assembly aborted, inbound chunk set has a gap"
        );
        return Err(TransferError::MissingChunk {
            chunk_no: missing as u32,
        });
    }

    let mut combined = BytesMut::with_capacity(set.size as usize);
    for chunk in set.chunks.iter().flatten() {
        combined.extend_from_slice(chunk);
    }

    let path = output_dir.join(&set.name);
    storage.write_file(&path, &combined).await?;
    info!(path = %path.display(), bytes = combined.len(), "file saved");
    Ok(path)
}
