use std::fmt;

use codec::Error as CodecError;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced to callers. The codec and transaction layer never
/// swallow errors; they tag and propagate.
#[derive(Debug, Clone)]
pub enum Error {
    Timeout,
    PeerUnreachable(String),
    MalformedValue { offset: usize },
    UnsupportedVersion,
    UnsupportedOperation,
    NotFound,
    AccessDenied,
    Unserializable,
    PayloadTooLarge { len: usize, max: usize },
    RemoteError { kind: String, message: String },
    ServiceStopped,
}

impl Error {
    /// Stable short tag used when classifying a remote failure onto the
    /// wire as `REPLY_ERR(kind, message)`.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::PeerUnreachable(_) => "PeerUnreachable",
            Self::MalformedValue { .. } => "MalformedValue",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::UnsupportedOperation => "UnsupportedOperation",
            Self::NotFound => "NotFound",
            Self::AccessDenied => "AccessDenied",
            Self::Unserializable => "Unserializable",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::RemoteError { .. } => "RemoteError",
            Self::ServiceStopped => "ServiceStopped",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "transaction timed out after all retries"),
            Self::PeerUnreachable(why) => write!(f, "peer unreachable: {why}"),
            Self::MalformedValue { offset } => write!(f, "malformed value at offset {offset}"),
            Self::UnsupportedVersion => write!(f, "unsupported protocol version"),
            Self::UnsupportedOperation => write!(f, "target does not support this operation"),
            Self::NotFound => write!(f, "unknown name or id"),
            Self::AccessDenied => write!(f, "operation denied by authenticator"),
            Self::Unserializable => write!(f, "value graph is not serializable"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds limit of {max}")
            }
            Self::RemoteError { kind, message } => write!(f, "remote error [{kind}]: {message}"),
            Self::ServiceStopped => write!(f, "service is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnexpectedEof { offset }
            | CodecError::UnknownTag { offset, .. }
            | CodecError::InvalidUtf8 { offset }
            | CodecError::DuplicateKey { offset }
            | CodecError::BadMagic { offset } => Error::MalformedValue { offset },
            CodecError::Unserializable => Error::Unserializable,
            CodecError::PayloadTooLarge { len, max } => Error::PayloadTooLarge { len, max },
        }
    }
}
