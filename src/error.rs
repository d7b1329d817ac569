//! Error types for the stream synthesis backend

use thiserror::Error;

/// Result type for synthesis operations
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Synthesis errors
///
/// Every variant is fatal for the translation unit being synthesized. The
/// `CoordinateNotFound` and `AddressChannelMismatch` variants are internal
/// consistency failures; the rest are configuration errors in the inputs.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Configuration error in stream `{stream}`: {message}")]
    Configuration { stream: String, message: String },

    #[error("Missing end value for loop induction variable `{liv}`")]
    MissingEndValue { liv: String },

    #[error("Missing runtime bound `{port}` for loop induction variable `{liv}`")]
    MissingRuntimeBound { liv: String, port: String },

    #[error("Unknown loop induction variable `{liv}`")]
    UnknownLiv { liv: String },

    #[error("Invalid loop nest: {message}")]
    InvalidForest { message: String },

    #[error("Stream `{stream}`: {channels} channels do not evenly divide the {count} {unit} of the {region} region")]
    ChannelMismatch {
        stream: String,
        region: String,
        channels: usize,
        count: usize,
        unit: &'static str,
    },

    #[error("Stream `{stream}`: innermost accessed axis `{accessed}` is not the innermost loop axis `{innermost}`")]
    InnermostMismatch {
        stream: String,
        accessed: String,
        innermost: String,
    },

    #[error("Stream `{stream}`: invalid geometry along `{axis}`: {message}")]
    InvalidGeometry {
        stream: String,
        axis: String,
        message: String,
    },

    #[error("Internal error in stream `{stream}`: buffer coordinate {coordinate:?} does not exist")]
    CoordinateNotFound { stream: String, coordinate: Vec<usize> },

    #[error("Internal error in stream `{stream}`: address generator has {generator} channels but the buffer expects {buffer}")]
    AddressChannelMismatch {
        stream: String,
        generator: usize,
        buffer: usize,
    },

    #[error("Descriptor error: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl SynthesisError {
    pub fn configuration(stream: impl Into<String>, msg: impl Into<String>) -> Self {
        SynthesisError::Configuration {
            stream: stream.into(),
            message: msg.into(),
        }
    }

    pub fn unknown_liv(liv: impl Into<String>) -> Self {
        SynthesisError::UnknownLiv { liv: liv.into() }
    }

    pub fn invalid_forest(msg: impl Into<String>) -> Self {
        SynthesisError::InvalidForest { message: msg.into() }
    }

    pub fn geometry(
        stream: impl Into<String>,
        axis: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        SynthesisError::InvalidGeometry {
            stream: stream.into(),
            axis: axis.into(),
            message: msg.into(),
        }
    }

    pub fn coordinate_not_found(stream: impl Into<String>, coordinate: &[usize]) -> Self {
        SynthesisError::CoordinateNotFound {
            stream: stream.into(),
            coordinate: coordinate.to_vec(),
        }
    }
}
