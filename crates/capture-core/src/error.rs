//! Error types for the capture core

/// Result type alias using the capture Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating, recording or finalizing a session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No relay shared secret is provisioned
    #[error("Relay is not configured: missing TURN_STATIC_AUTH_SECRET")]
    RelayNotConfigured,

    /// SDP negotiation error (malformed or unsupported offer)
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Container writer failed to start or stop
    #[error("Recorder error: {0}")]
    RecorderError(String),

    /// External transcoding step failed
    #[error("Transcode error: {0}")]
    TranscodeError(String),

    /// Uploading one artifact failed
    #[error("Upload of {artifact} to {key} failed: {reason}")]
    Upload {
        artifact: String,
        key: String,
        reason: String,
    },

    /// Object storage request failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Metadata record request failed
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageError(_)
                | Error::MetadataError(_)
                | Error::OperationTimeout(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::RelayNotConfigured)
    }

    /// Check if the caller supplied an offer that could not be negotiated
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Error::SdpError(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::StorageError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::Upload {
            artifact: "audio".to_string(),
            key: "sessions/s1/audio.wav".to_string(),
            reason: "HTTP 500".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Upload of audio to sessions/s1/audio.wav failed: HTTP 500"
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::StorageError("test".to_string()).is_retryable());
        assert!(Error::OperationTimeout("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_config_error() {
        assert!(Error::InvalidConfig("test".to_string()).is_config_error());
        assert!(Error::RelayNotConfigured.is_config_error());
        assert!(!Error::SdpError("test".to_string()).is_config_error());
    }

    #[test]
    fn test_error_is_negotiation_error() {
        assert!(Error::SdpError("bad".to_string()).is_negotiation_error());
        assert!(!Error::WebRtcError("bad".to_string()).is_negotiation_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
