use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Validate,
    DeriveKeys,
    PackStream,
    BuildMetadata,
    Assemble,
    Demux,
    Info,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Probe => "probe",
            Stage::Validate => "validate",
            Stage::DeriveKeys => "derive-keys",
            Stage::PackStream => "pack-stream",
            Stage::BuildMetadata => "build-metadata",
            Stage::Assemble => "assemble",
            Stage::Demux => "demux",
            Stage::Info => "info",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum UsmError {
    #[error("I/O error during {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid probe output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Probe failed for {}: {message}", path.display())]
    ProbeFailed { path: PathBuf, message: String },

    #[error("Unsupported codec {codec} in container {format}: {reason}")]
    UnsupportedCodec {
        codec: String,
        format: String,
        reason: String,
    },

    #[error("Corrupt frame table during validate at frame {frame}: computed size {size}")]
    CorruptFrameTable { frame: usize, size: i64 },

    #[error("Page schema mismatch during build-metadata: {0}")]
    SchemaMismatch(String),

    #[error("Value out of range during {stage}: {field}")]
    FormatOverflow { stage: Stage, field: String },

    #[error("Truncated stream during {stage} at chunk {chunk} (offset {offset:#x}): {message}")]
    TruncatedStream {
        stage: Stage,
        chunk: usize,
        offset: u64,
        message: String,
    },

    #[error("Malformed chunk during {stage} at chunk {chunk} (offset {offset:#x}): {message}")]
    MalformedChunk {
        stage: Stage,
        chunk: usize,
        offset: u64,
        message: String,
    },

    #[error("Invalid key {0:?}: expected up to 16 hex digits with optional 0x prefix")]
    InvalidKeyFormat(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl UsmError {
    pub fn overflow(stage: Stage, field: impl Into<String>) -> Self {
        Self::FormatOverflow {
            stage,
            field: field.into(),
        }
    }

    pub fn probe_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ProbeFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stage that raised the error, when it is tied to one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Io { stage, .. }
            | Self::FormatOverflow { stage, .. }
            | Self::TruncatedStream { stage, .. }
            | Self::MalformedChunk { stage, .. } => Some(*stage),
            Self::Json(_) | Self::ProbeFailed { .. } => Some(Stage::Probe),
            Self::UnsupportedCodec { .. } | Self::CorruptFrameTable { .. } => {
                Some(Stage::Validate)
            }
            Self::SchemaMismatch(_) => Some(Stage::BuildMetadata),
            Self::InvalidKeyFormat(_) => Some(Stage::DeriveKeys),
            Self::FileNotFound(_) => None,
        }
    }
}

/// Attach a pipeline stage to I/O failures
pub trait IoStage<T> {
    fn in_stage(self, stage: Stage) -> Result<T>;
}

impl<T> IoStage<T> for std::io::Result<T> {
    fn in_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|source| UsmError::Io { stage, source })
    }
}

pub type Result<T> = std::result::Result<T, UsmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_carry_stage() {
        let failed: std::io::Result<()> = Err(std::io::Error::other("disk gone"));
        let err = failed.in_stage(Stage::Assemble).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Assemble));
        assert!(err.to_string().contains("assemble"));
    }

    #[test]
    fn test_frame_errors_name_the_frame() {
        let err = UsmError::CorruptFrameTable { frame: 7, size: -3 };
        assert!(err.to_string().contains("frame 7"));
        assert!(err.to_string().contains("validate"));
        assert_eq!(err.stage(), Some(Stage::Validate));
    }

    #[test]
    fn test_framing_errors_name_their_stage() {
        let err = UsmError::TruncatedStream {
            stage: Stage::Info,
            chunk: 2,
            offset: 0x40,
            message: "payload declares 64 bytes, 3 available".into(),
        };
        assert_eq!(err.stage(), Some(Stage::Info));
        assert!(err.to_string().contains("during info at chunk 2"));

        let err = UsmError::SchemaMismatch("page 1 lacks resv".into());
        assert!(err.to_string().contains("build-metadata"));
    }
}
