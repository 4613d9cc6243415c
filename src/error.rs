//! Error types for the avatar deformation and appearance core

use thiserror::Error;

/// Broad classes of failure. None of them is fatal: the worst outcome is an
/// un-morphed or un-baked avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Truncated or malformed binary morph/mesh data.
    DataCorruption,
    /// Skeleton or parameter description references something unknown.
    Configuration,
    /// NaN or infinite weights.
    NumericAnomaly,
    /// A texture has not finished loading yet.
    ResourceUnavailable,
}

#[derive(Error, Debug)]
pub enum AvatarError {
    #[error("Joint '{name}' already exists")]
    DuplicateJoint { name: String },

    #[error("Joint '{name}' references unknown parent '{parent}'")]
    UnknownParent { name: String, parent: String },

    #[error("Joint '{name}' would be a second root")]
    MultipleRoots { name: String },

    #[error("Parenting '{name}' under '{parent}' would create a cycle")]
    JointCycle { name: String, parent: String },

    #[error("Unknown joint '{name}'")]
    UnknownJoint { name: String },

    #[error("Malformed mesh: {reason}")]
    MalformedMesh { reason: String },

    #[error("Truncated data while reading {context}")]
    TruncatedData { context: String },

    #[error("Invalid vertex count {count}")]
    InvalidVertexCount { count: i64 },

    #[error("Vertex index {index} out of range (bound {bound})")]
    IndexOutOfRange { index: u32, bound: u32 },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("XML parse failed: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("Non-finite weight for '{name}'")]
    NumericAnomaly { name: String },

    #[error("Resource not yet available: {what}")]
    ResourceUnavailable { what: String },

    #[error("Invalid texture: {reason}")]
    InvalidTexture { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AvatarResult<T> = Result<T, AvatarError>;

impl AvatarError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AvatarError::DuplicateJoint { .. }
            | AvatarError::UnknownParent { .. }
            | AvatarError::MultipleRoots { .. }
            | AvatarError::JointCycle { .. }
            | AvatarError::UnknownJoint { .. }
            | AvatarError::Configuration { .. }
            | AvatarError::Xml(_) => ErrorCategory::Configuration,
            AvatarError::MalformedMesh { .. }
            | AvatarError::TruncatedData { .. }
            | AvatarError::InvalidVertexCount { .. }
            | AvatarError::IndexOutOfRange { .. }
            | AvatarError::InvalidTexture { .. }
            | AvatarError::Io(_) => ErrorCategory::DataCorruption,
            AvatarError::NumericAnomaly { .. } => ErrorCategory::NumericAnomaly,
            AvatarError::ResourceUnavailable { .. } => ErrorCategory::ResourceUnavailable,
        }
    }

    pub(crate) fn truncated(context: impl Into<String>) -> Self {
        AvatarError::TruncatedData { context: context.into() }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        AvatarError::MalformedMesh { reason: reason.into() }
    }

    /// Map an I/O failure while decoding a binary block: running off the end of
    /// the stream becomes `TruncatedData`, anything else stays `Io`.
    pub(crate) fn from_read(err: std::io::Error, context: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::truncated(context)
        } else {
            AvatarError::Io(err)
        }
    }
}
