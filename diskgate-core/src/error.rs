//! Error taxonomy shared by every layer of the helper.
//!
//! Each concern has its own `thiserror` enum. All of them collapse onto a
//! single wire-level [`ErrorKind`], which is what actually crosses the
//! privilege boundary inside a reply. An [`ErrorKind`] belongs to exactly one
//! [`ErrorCategory`]; the category decides whether a caller may retry.
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Broad classes of failure, as seen by the unprivileged caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed input, caught before touching any OS state.
    Validation,
    /// An OS object could not be created or resolved.
    Resource,
    /// The caller failed authentication.
    Security,
    /// The device-classification guard blocked the operation.
    Safety,
    /// Timeout or channel failure between client and helper.
    Transport,
    /// Another process objected to the operation.
    Dissent,
}

/// Wire-level error code carried in a reply record.
///
/// The discriminants are part of the wire format and must never be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    MalformedDeviceName = 1,
    MalformedMessage = 2,
    SessionCreateFailed = 10,
    DiskResolveFailed = 11,
    DescriptionFetchFailed = 12,
    Busy = 13,
    CallbackTimeout = 14,
    CallbackAbandoned = 15,
    Internal = 16,
    RootCallerRejected = 20,
    InvalidSignature = 21,
    IdentityMismatch = 22,
    ClassificationUnavailable = 30,
    DestructiveOpOnInternalDevice = 31,
    EndpointCreateFailed = 40,
    ReplyTimeout = 41,
    ChannelFailed = 42,
    Dissent = 50,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::MalformedDeviceName | ErrorKind::MalformedMessage => {
                ErrorCategory::Validation
            }
            ErrorKind::SessionCreateFailed
            | ErrorKind::DiskResolveFailed
            | ErrorKind::DescriptionFetchFailed
            | ErrorKind::Busy
            | ErrorKind::CallbackTimeout
            | ErrorKind::CallbackAbandoned
            | ErrorKind::Internal => ErrorCategory::Resource,
            ErrorKind::RootCallerRejected
            | ErrorKind::InvalidSignature
            | ErrorKind::IdentityMismatch => ErrorCategory::Security,
            // Failing to classify is a refusal to act, not a resource hiccup.
            ErrorKind::ClassificationUnavailable | ErrorKind::DestructiveOpOnInternalDevice => {
                ErrorCategory::Safety
            }
            ErrorKind::EndpointCreateFailed | ErrorKind::ReplyTimeout | ErrorKind::ChannelFailed => {
                ErrorCategory::Transport
            }
            ErrorKind::Dissent => ErrorCategory::Dissent,
        }
    }

    /// Security and safety refusals are final for the request: no retry, no
    /// downgrade path.
    pub fn is_final(self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Security | ErrorCategory::Safety
        )
    }

    /// A short user-facing description of the failure.
    pub fn describe(self) -> &'static str {
        match self {
            ErrorKind::MalformedDeviceName => "the device name is malformed",
            ErrorKind::MalformedMessage => "the helper could not decode the request",
            ErrorKind::SessionCreateFailed => "could not open a disk arbitration session",
            ErrorKind::DiskResolveFailed => "the device could not be found",
            ErrorKind::DescriptionFetchFailed => "the device description could not be read",
            ErrorKind::Busy => "another disk operation is already in progress",
            ErrorKind::CallbackTimeout => "the operating system did not answer in time",
            ErrorKind::CallbackAbandoned => "the operation was abandoned before completing",
            ErrorKind::Internal => "the helper hit an internal error",
            ErrorKind::RootCallerRejected => "requests from root callers are refused",
            ErrorKind::InvalidSignature => "the calling application failed code identity checks",
            ErrorKind::IdentityMismatch => "the calling application is not trusted",
            ErrorKind::ClassificationUnavailable => "the device could not be classified",
            ErrorKind::DestructiveOpOnInternalDevice => "refusing to touch an internal device",
            ErrorKind::EndpointCreateFailed => "the privileged helper is not reachable",
            ErrorKind::ReplyTimeout => "the privileged helper did not reply in time",
            ErrorKind::ChannelFailed => "the connection to the privileged helper failed",
            ErrorKind::Dissent => "another process objected to the operation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl From<ErrorKind> for u32 {
    fn from(kind: ErrorKind) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for ErrorKind {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let kind = match value {
            1 => ErrorKind::MalformedDeviceName,
            2 => ErrorKind::MalformedMessage,
            10 => ErrorKind::SessionCreateFailed,
            11 => ErrorKind::DiskResolveFailed,
            12 => ErrorKind::DescriptionFetchFailed,
            13 => ErrorKind::Busy,
            14 => ErrorKind::CallbackTimeout,
            15 => ErrorKind::CallbackAbandoned,
            16 => ErrorKind::Internal,
            20 => ErrorKind::RootCallerRejected,
            21 => ErrorKind::InvalidSignature,
            22 => ErrorKind::IdentityMismatch,
            30 => ErrorKind::ClassificationUnavailable,
            31 => ErrorKind::DestructiveOpOnInternalDevice,
            40 => ErrorKind::EndpointCreateFailed,
            41 => ErrorKind::ReplyTimeout,
            42 => ErrorKind::ChannelFailed,
            50 => ErrorKind::Dissent,
            other => return Err(CodecError::Malformed(format!("unknown error kind {other}"))),
        };
        Ok(kind)
    }
}

/// Failures of the fixed-capacity message codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value does not fit the payload buffer. Nothing was written.
    #[error("payload of {size} bytes exceeds the {capacity} byte capacity")]
    PayloadTooLarge { size: usize, capacity: usize },

    /// A string with an embedded NUL cannot survive the terminator encoding.
    #[error("string contains an interior NUL byte")]
    InteriorNul,

    #[error("unknown opcode {0}")]
    UnknownOpcode(i32),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedMessage
    }
}

/// Failures of the socket transport, on either side.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The helper endpoint does not exist or refused the connection.
    #[error("could not reach helper endpoint {endpoint}: {source}")]
    EndpointCreateFailed {
        endpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The server could not bind its listener. Fatal for the helper.
    #[error("could not bind helper endpoint {endpoint}: {source}")]
    BindFailed {
        endpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no reply from the helper within {0:?}")]
    ReplyTimeout(Duration),

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] CodecError),

    /// The reply had a valid frame but not the opcode the request expects.
    #[error("unexpected reply opcode {0}")]
    UnexpectedReply(i32),

    /// The helper answered, but with a refusal instead of the expected reply.
    #[error("helper refused the request: {0}")]
    Refused(ErrorKind),

    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::EndpointCreateFailed { .. } | TransportError::BindFailed { .. } => {
                ErrorKind::EndpointCreateFailed
            }
            TransportError::ReplyTimeout(_) => ErrorKind::ReplyTimeout,
            TransportError::MalformedMessage(_) | TransportError::UnexpectedReply(_) => {
                ErrorKind::MalformedMessage
            }
            TransportError::Refused(kind) => *kind,
            TransportError::Io(_) => ErrorKind::ChannelFailed,
        }
    }
}

/// Reasons a caller was refused by the authenticator.
///
/// Every variant is a rejection. There is no "soft" failure: an error while
/// gathering identity data is reported as one of these, never skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("caller is running as root")]
    RootCallerRejected,

    /// Peer credentials could not be read from the connection.
    #[error("peer credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    /// The code identity could not be derived, or it failed verification.
    #[error("invalid code signature: {0}")]
    InvalidSignature(String),

    #[error("identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch { expected: String, found: String },
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::RootCallerRejected => ErrorKind::RootCallerRejected,
            SecurityError::CredentialsUnavailable(_) | SecurityError::InvalidSignature(_) => {
                ErrorKind::InvalidSignature
            }
            SecurityError::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
        }
    }
}

/// Outcomes of the disk safety validator that forbid the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafetyError {
    /// The "is internal" property was missing or had the wrong type.
    #[error("device {0} could not be classified")]
    ClassificationUnavailable(String),

    #[error("refusing destructive operation on internal device {0}")]
    DestructiveOpOnInternalDevice(String),
}

impl SafetyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SafetyError::ClassificationUnavailable(_) => ErrorKind::ClassificationUnavailable,
            SafetyError::DestructiveOpOnInternalDevice(_) => {
                ErrorKind::DestructiveOpOnInternalDevice
            }
        }
    }
}

/// Failures of one disk operation, from name validation to callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("malformed device name {0:?}")]
    MalformedDeviceName(String),

    #[error("could not create arbitration session: {0}")]
    SessionCreateFailed(String),

    #[error("could not resolve disk {name}: {reason}")]
    DiskResolveFailed { name: String, reason: String },

    #[error("could not fetch description of {name}: {reason}")]
    DescriptionFetchFailed { name: String, reason: String },

    #[error(transparent)]
    Safety(#[from] SafetyError),

    /// Another process objected. Carries the OS status code and message.
    #[error("operation dissented (status {status}): {message}")]
    Dissent { status: i32, message: String },

    #[error("no completion callback within {0:?}")]
    CallbackTimeout(Duration),

    #[error("completion callback dropped without a result")]
    CallbackAbandoned,

    #[error("another disk operation is in progress")]
    Busy,
}

impl OperationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::MalformedDeviceName(_) => ErrorKind::MalformedDeviceName,
            OperationError::SessionCreateFailed(_) => ErrorKind::SessionCreateFailed,
            OperationError::DiskResolveFailed { .. } => ErrorKind::DiskResolveFailed,
            OperationError::DescriptionFetchFailed { .. } => ErrorKind::DescriptionFetchFailed,
            OperationError::Safety(e) => e.kind(),
            OperationError::Dissent { .. } => ErrorKind::Dissent,
            OperationError::CallbackTimeout(_) => ErrorKind::CallbackTimeout,
            OperationError::CallbackAbandoned => ErrorKind::CallbackAbandoned,
            OperationError::Busy => ErrorKind::Busy,
        }
    }
}

/// Failures loading the helper configuration or signing manifest.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_survive_the_wire() {
        for kind in [
            ErrorKind::MalformedDeviceName,
            ErrorKind::Busy,
            ErrorKind::IdentityMismatch,
            ErrorKind::DestructiveOpOnInternalDevice,
            ErrorKind::ReplyTimeout,
            ErrorKind::Dissent,
        ] {
            assert_eq!(ErrorKind::try_from(u32::from(kind)), Ok(kind));
        }
        assert!(ErrorKind::try_from(0).is_err());
        assert!(ErrorKind::try_from(999).is_err());
    }

    #[test]
    fn only_security_and_safety_are_final() {
        assert!(ErrorKind::RootCallerRejected.is_final());
        assert!(ErrorKind::IdentityMismatch.is_final());
        assert!(ErrorKind::DestructiveOpOnInternalDevice.is_final());
        assert!(ErrorKind::ClassificationUnavailable.is_final());
        assert!(!ErrorKind::ReplyTimeout.is_final());
        assert!(!ErrorKind::Dissent.is_final());
        assert!(!ErrorKind::Busy.is_final());
        assert!(!ErrorKind::MalformedDeviceName.is_final());
    }

    #[test]
    fn operation_errors_map_to_their_category() {
        let err = OperationError::Dissent {
            status: 99,
            message: "Volume busy".into(),
        };
        assert_eq!(err.kind().category(), ErrorCategory::Dissent);

        let err: OperationError =
            SafetyError::DestructiveOpOnInternalDevice("disk2".into()).into();
        assert_eq!(err.kind(), ErrorKind::DestructiveOpOnInternalDevice);
        assert_eq!(err.kind().category(), ErrorCategory::Safety);

        let err = OperationError::MalformedDeviceName("d".into());
        assert_eq!(err.kind().category(), ErrorCategory::Validation);
    }
}
