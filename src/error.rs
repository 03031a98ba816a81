// THEORY:
// The `error` module is the single vocabulary every stage of the stitcher uses to
// describe what went wrong. Stages raise a rich `StitchError` (with its source chain
// intact for logging) and the coordinator collapses it into the flat, display-ready
// `StitchResult::Failure` that callers receive.
//
// Key architectural principles:
// 1.  **Closed Taxonomy**: Every failure is one of four kinds: decode, workspace,
//     engine, or unexpected. Nothing escapes unclassified.
// 2.  **Engine Codes Stay Native**: The engine's integer status is kept next to the
//     translated `EngineErrorCode` so that an `Unknown` failure can still be traced
//     back to the engine-specific code that produced it.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure classes the stitching engine can report, after translation from its
/// native status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineErrorCode {
    /// Too few images, or too little pairwise overlap to connect them.
    NeedMoreImages,
    /// The geometric transform between a pair of images could not be solved.
    HomographyEstimationFailed,
    /// Refining the estimated parameters diverged.
    CameraParamsAdjustFailed,
    /// Any engine status outside the known set.
    Unknown,
}

impl EngineErrorCode {
    /// The engine's own name for this failure, used verbatim in user-facing messages.
    pub fn description(&self) -> &'static str {
        match self {
            EngineErrorCode::NeedMoreImages => "ERR_NEED_MORE_IMGS",
            EngineErrorCode::HomographyEstimationFailed => "ERR_HOMOGRAPHY_EST_FAIL",
            EngineErrorCode::CameraParamsAdjustFailed => "ERR_CAMERA_PARAMS_ADJUST_FAIL",
            EngineErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EngineErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The classification carried by a `StitchResult::Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// An input reference could not be read as an image.
    Decode,
    /// Temporary-file or result-file I/O failed.
    Workspace,
    /// The engine could not produce a composite.
    Engine(EngineErrorCode),
    /// Anything else raised while orchestrating a request.
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Decode => write!(f, "decode error"),
            ErrorKind::Workspace => write!(f, "workspace error"),
            ErrorKind::Engine(code) => write!(f, "engine error ({code})"),
            ErrorKind::Unexpected => write!(f, "unexpected error"),
        }
    }
}

/// Every error a stitch request can raise before it is classified for delivery.
#[derive(Error, Debug)]
pub enum StitchError {
    /// A materialized input could not be decoded.
    #[error("failed to decode image {reference}")]
    Decode {
        /// Human-readable name of the offending reference.
        reference: String,
        #[source]
        source: image::ImageError,
    },

    /// Creating, reading, writing or deleting a workspace file failed.
    #[error("{context}")]
    Workspace {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The composite could not be written to its result slot.
    #[error("failed to encode result to {location:?}")]
    Encode {
        location: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The engine reported a failure status.
    #[error("Can't stitch images: {code}")]
    Engine {
        code: EngineErrorCode,
        /// The raw status the engine returned.
        native_status: i32,
    },

    /// The request was replaced by a newer one and stopped early. Never delivered.
    #[error("request was superseded")]
    Superseded,

    /// Catch-all for failures with no better classification (including panics).
    #[error("{message}")]
    Unexpected { message: String },
}

impl StitchError {
    pub fn workspace(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Workspace {
            context: context.into(),
            source,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Collapses the error into the classification callers see.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StitchError::Decode { .. } => ErrorKind::Decode,
            StitchError::Workspace { .. } | StitchError::Encode { .. } => ErrorKind::Workspace,
            StitchError::Engine { code, .. } => ErrorKind::Engine(*code),
            StitchError::Superseded | StitchError::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }

    /// The full message including every source in the chain, e.g.
    /// `failed to decode image a.jpg: Format error decoding Jpeg: ...`.
    pub fn message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = std::error::Error::source(cause);
        }
        message
    }
}

/// The outcome of one request. Either a location or a classified error, never both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StitchResult {
    Success {
        /// Where the encoded composite was written.
        location: PathBuf,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl StitchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StitchResult::Success { .. })
    }

    /// The failure classification, if this is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            StitchResult::Success { .. } => None,
            StitchResult::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl From<Result<PathBuf, StitchError>> for StitchResult {
    fn from(result: Result<PathBuf, StitchError>) -> Self {
        match result {
            Ok(location) => StitchResult::Success { location },
            Err(error) => StitchResult::Failure {
                kind: error.kind(),
                message: error.message(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_failure_message_names_the_engine_status() {
        let error = StitchError::Engine {
            code: EngineErrorCode::NeedMoreImages,
            native_status: 1,
        };
        assert_eq!(error.to_string(), "Can't stitch images: ERR_NEED_MORE_IMGS");
        assert_eq!(
            error.kind(),
            ErrorKind::Engine(EngineErrorCode::NeedMoreImages)
        );
    }

    #[test]
    fn encode_failures_are_workspace_failures() {
        let error = StitchError::Encode {
            location: PathBuf::from("/nowhere/result.jpg"),
            source: image::ImageError::IoError(std::io::Error::other("disk full")),
        };
        assert_eq!(error.kind(), ErrorKind::Workspace);
        assert!(error.message().ends_with("disk full"));
    }

    #[test]
    fn failure_result_carries_the_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let result: StitchResult =
            Err::<PathBuf, _>(StitchError::workspace("failed to read input a.jpg", io)).into();

        match result {
            StitchResult::Failure { kind, message } => {
                assert_eq!(kind, ErrorKind::Workspace);
                assert_eq!(message, "failed to read input a.jpg: no such file");
            }
            StitchResult::Success { .. } => panic!("expected a failure"),
        }
    }

    #[test]
    fn success_result_has_no_error_kind() {
        let result: StitchResult = Ok::<_, StitchError>(PathBuf::from("out.jpg")).into();
        assert!(result.is_success());
        assert_eq!(result.error_kind(), None);
    }
}
