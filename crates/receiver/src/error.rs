//! Error types for the WebRTC receiver

/// Result type alias using the receiver Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating, building the media graph or rendering
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling failure (empty or rejected answer, hook failure)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// SDP text could not be parsed or applied
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Operation not allowed in the current negotiation state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Engine or required stage could not be constructed
    #[error("Pipeline construction failed: {0}")]
    PipelineConstruction(String),

    /// Two stages (or a pad and a stage) could not be linked
    #[error("Link failed: {0}")]
    LinkError(String),

    /// Stage not present in the graph
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// A stage failed while processing a buffer
    #[error("Stage error: {0}")]
    StageError(String),

    /// Delivered buffer could not be mapped as a frame
    #[error("Frame mapping failed: {0}")]
    FrameMapping(String),

    /// Video decoding error
    #[error("Decoding error: {0}")]
    DecodeError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Rendering surface error
    #[error("Render error: {0}")]
    RenderError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error must abort startup
    ///
    /// Only configuration and construction failures are fatal. Engine errors
    /// during negotiation end the round in `Failed`, which a new answer can
    /// recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::PipelineConstruction(_))
    }

    /// Check if this error is recoverable (logged, affected branch or frame dropped)
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Check if this error belongs to the signaling exchange
    pub fn is_signaling_error(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::SdpError(_) | Error::InvalidState(_)
        )
    }
}
