use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Transfer protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("A transfer is already in flight, wait for it to finish")]
    TransferBusy,

    #[error("Inbound chunk set is incomplete, chunk {chunk_no} missing")]
    MissingChunk { chunk_no: u32 },

    #[error("Invalid discovery payload: {0}")]
    InvalidPayload(String),

    #[error("Not connected to a peer")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let transfer_error: TransferError = io_error.into();

        match transfer_error {
            TransferError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_error = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let transfer_error: TransferError = json_error.into();

        match transfer_error {
            TransferError::Serialization(_) => {}
            _ => panic!("Expected Serialization error variant"),
        }
    }

    #[test]
    fn test_base64_error_conversion() {
        use base64::Engine;
        let b64_error = base64::engine::general_purpose::STANDARD
            .decode("not-base64!!!")
            .unwrap_err();
        let transfer_error: TransferError = b64_error.into();

        match transfer_error {
            TransferError::Base64(_) => {}
            _ => panic!("Expected Base64 error variant"),
        }
    }

    #[test]
    fn test_transfer_busy_message() {
        let error = TransferError::TransferBusy;
        assert!(error.to_string().contains("already in flight"));
    }

    #[test]
    fn test_missing_chunk_message() {
        let error = TransferError::MissingChunk { chunk_no: 7 };
        let error_string = error.to_string();
        assert!(error_string.contains('7'));
        assert!(error_string.contains("incomplete"));
    }

    #[test]
    fn test_file_not_found_error() {
        let path = PathBuf::from("/nonexistent/file.txt");
        let error = TransferError::FileNotFound(path.clone());
        assert!(error.to_string().contains(path.to_string_lossy().as_ref()));
    }

    #[test]
    fn test_invalid_payload_error() {
        let error = TransferError::InvalidPayload("udp://x".to_string());
        assert!(error.to_string().contains("udp://x"));
    }
}
