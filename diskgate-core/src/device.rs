use crate::error::{CodecError, OperationError};
use std::fmt;

/// Minimum BSD name length accepted on the request path (e.g. `"sd"` is
/// rejected only below this).
pub const MIN_BSD_NAME_LEN: usize = 2;

/// Minimum BSD name length accepted on the enumeration path.
pub const MIN_ENUMERATED_BSD_NAME_LEN: usize = 3;

/// Longest BSD name that fits a request record, terminator excluded.
pub const MAX_BSD_NAME_LEN: usize = 63;

/// The broad kind of a block device, as reported by enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceKind {
    /// A built-in disk that is not removable.
    Internal = 0,
    /// A disk attached over USB.
    Usb = 1,
    /// An SD or MMC card, whichever bus the reader sits on.
    Sd = 2,
    Other = 3,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Internal => "internal",
            DeviceKind::Usb => "usb",
            DeviceKind::Sd => "sd",
            DeviceKind::Other => "other",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DeviceKind> for u32 {
    fn from(kind: DeviceKind) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for DeviceKind {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceKind::Internal),
            1 => Ok(DeviceKind::Usb),
            2 => Ok(DeviceKind::Sd),
            3 => Ok(DeviceKind::Other),
            other => Err(CodecError::Malformed(format!("unknown device kind {other}"))),
        }
    }
}

/// Represents a block device discovered on the system.
///
/// Descriptors are created fresh by [`crate::platform::enumerate_devices`]
/// and are only a presentation snapshot. The executor never trusts a
/// descriptor's classification; it re-reads the device description for
/// every destructive operation.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDescriptor {
    /// Opaque OS identifier of the device (the packed major/minor number on Linux).
    pub service_id: u64,
    /// The kernel-provided short name of the device (e.g. "sdb", "mmcblk0").
    pub bsd_name: String,
    /// A human-readable model or vendor name.
    pub display_name: String,
    /// Total size of the device in bytes.
    pub size_bytes: u64,
    pub device_kind: DeviceKind,
}

impl DeviceDescriptor {
    /// Size in gigabytes, for display.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:<25} {:.1} GB [{}]",
            self.bsd_name,
            self.display_name,
            self.size_gb(),
            self.device_kind
        )
    }
}

/// Checks a BSD device name before it is used to address any OS object.
///
/// Names must be at least `min_len` characters, fit a request record, and be
/// plain ASCII alphanumerics so they cannot name anything outside the block
/// device namespace.
pub fn validate_bsd_name(name: &str, min_len: usize) -> Result<(), OperationError> {
    let well_formed = name.len() >= min_len
        && name.len() <= MAX_BSD_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric());
    if well_formed {
        Ok(())
    } else {
        Err(OperationError::MalformedDeviceName(name.to_string()))
    }
}
