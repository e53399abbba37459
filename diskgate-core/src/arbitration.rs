//! The seam between the executor and the operating system's disk layer.
//!
//! A [`DiskArbiter`] opens one [`ArbitrationSession`] per operation. The
//! session resolves disks, describes them, and issues unmount or eject
//! requests whose completion arrives later through an [`OperationCallback`].
//! The executor waits for that callback on a [`RunLoop`].
//!
//! Callbacks carry their own context: an `OperationCallback` owns the sending
//! half of the run loop it was created from, so completion needs no
//! process-wide state to find its way back to the waiting operation.
use crate::device::DeviceKind;
use crate::error::OperationError;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Upper bound on the dissenter message bytes we are willing to convert.
pub const DISSENT_MESSAGE_LIMIT: usize = 256;

/// Message reported when a dissenter's text cannot be converted.
pub const DISSENT_MESSAGE_UNAVAILABLE: &str = "unavailable";

/// Well-known keys of a [`DiskDescription`].
pub mod keys {
    /// `Bool`: the device is built into the machine.
    pub const DEVICE_INTERNAL: &str = "device.internal";
    /// `Text`: the BSD name of the whole disk.
    pub const BSD_NAME: &str = "bsd.name";
    /// `Integer`: opaque OS identifier.
    pub const DEVICE_ID: &str = "device.id";
    /// `Text`: one of `usb`, `sd`, `internal`, `other`.
    pub const MEDIA_KIND: &str = "media.kind";
    /// `Text`: model or vendor name.
    pub const MEDIA_NAME: &str = "media.name";
    /// `Integer`: size in bytes.
    pub const MEDIA_SIZE: &str = "media.size";
    /// `Bool`: the disk, or a volume stacked on it, holds the running
    /// system's root filesystem.
    pub const SYSTEM_DISK: &str = "device.system";
}

/// A typed value in a disk description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Property {
    Bool(bool),
    Integer(u64),
    Text(String),
}

/// A snapshot of what the OS reports about one disk.
///
/// Accessors return `None` both for a missing key and for a value of the
/// wrong type; callers decide whether that is fatal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskDescription {
    properties: BTreeMap<String, Property>,
}

impl DiskDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Property) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: Property) {
        self.properties.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Property::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Property::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Property::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The media kind the OS reports, if it reports one we know.
    pub fn media_kind(&self) -> Option<DeviceKind> {
        match self.text(keys::MEDIA_KIND)? {
            "usb" => Some(DeviceKind::Usb),
            "sd" => Some(DeviceKind::Sd),
            "internal" => Some(DeviceKind::Internal),
            "other" => Some(DeviceKind::Other),
            _ => None,
        }
    }
}

/// The destructive operations the helper can carry out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiskOperation {
    /// Unmount every volume on the whole disk.
    Unmount,
    /// Unmount, then detach the disk from the system.
    Eject,
}

impl DiskOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskOperation::Unmount => "unmount",
            DiskOperation::Eject => "eject",
        }
    }
}

impl std::fmt::Display for DiskOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal from another process objecting to an arbitration request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dissenter {
    pub status: i32,
    /// Raw message bytes as handed over by the OS, if any.
    pub message: Option<Vec<u8>>,
}

impl Dissenter {
    pub fn new(status: i32, message: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    /// Best-effort conversion of the OS message to text.
    ///
    /// At most [`DISSENT_MESSAGE_LIMIT`] bytes are considered, and the text
    /// stops at the first NUL. A message that is absent, empty, or not UTF-8
    /// becomes [`DISSENT_MESSAGE_UNAVAILABLE`]. A multi-byte character split
    /// by the limit is dropped rather than failing the whole conversion.
    pub fn message_text(&self) -> String {
        let Some(raw) = self.message.as_deref() else {
            return DISSENT_MESSAGE_UNAVAILABLE.to_string();
        };
        let truncated = raw.len() > DISSENT_MESSAGE_LIMIT;
        let bounded = &raw[..raw.len().min(DISSENT_MESSAGE_LIMIT)];
        let bounded = match bounded.iter().position(|&b| b == 0) {
            Some(end) => &bounded[..end],
            None => bounded,
        };
        let text = match std::str::from_utf8(bounded) {
            Ok(text) => text,
            Err(e) if truncated && e.error_len().is_none() => {
                // Only the tail was cut mid-character.
                std::str::from_utf8(&bounded[..e.valid_up_to()]).unwrap_or_default()
            }
            Err(_) => "",
        };
        if text.is_empty() {
            DISSENT_MESSAGE_UNAVAILABLE.to_string()
        } else {
            text.to_string()
        }
    }
}

/// What a completion callback delivers to its run loop.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Completion {
    Finished(Option<Dissenter>),
    Abandoned,
}

/// A cooperative wait point for one operation's completion.
///
/// The thread that issues an OS request blocks in
/// [`RunLoop::run_until_complete`]; the matching [`OperationCallback`]
/// stops the loop from whichever thread the OS delivers it on.
pub struct RunLoop {
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLoop {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    /// Creates the typed callback for one operation, bound to this loop.
    pub fn callback(&self, operation: DiskOperation) -> OperationCallback {
        OperationCallback {
            operation,
            sender: Some(self.sender.clone()),
        }
    }

    /// Blocks until a callback completes or `timeout` elapses, and
    /// translates the outcome into a typed result.
    pub fn run_until_complete(&self, timeout: Duration) -> Result<(), OperationError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Completion::Finished(None)) => Ok(()),
            Ok(Completion::Finished(Some(dissenter))) => Err(OperationError::Dissent {
                status: dissenter.status,
                message: dissenter.message_text(),
            }),
            Ok(Completion::Abandoned) => Err(OperationError::CallbackAbandoned),
            Err(RecvTimeoutError::Timeout) => Err(OperationError::CallbackTimeout(timeout)),
            // The loop holds a sender itself, so this only happens if it is torn down.
            Err(RecvTimeoutError::Disconnected) => Err(OperationError::CallbackAbandoned),
        }
    }

    /// Blocks, without a bound, until the callback of a timed-out operation
    /// completes or is dropped.
    pub fn wait_for_late_completion(&self) {
        let _ = self.receiver.recv();
    }
}

/// Completion handle for one unmount or eject request.
///
/// Must be completed exactly once. Dropping it without calling
/// [`OperationCallback::complete`] reports the operation as abandoned, so a
/// backend that loses a callback fails the operation instead of stalling it.
#[derive(Debug)]
pub struct OperationCallback {
    operation: DiskOperation,
    sender: Option<Sender<Completion>>,
}

impl OperationCallback {
    pub fn operation(&self) -> DiskOperation {
        self.operation
    }

    /// Reports completion. `None` means no process objected.
    pub fn complete(mut self, dissenter: Option<Dissenter>) {
        if let Some(sender) = self.sender.take() {
            match &dissenter {
                Some(d) => tracing::warn!(
                    operation = %self.operation,
                    status = d.status,
                    "operation dissented"
                ),
                None => tracing::debug!(operation = %self.operation, "operation completed"),
            }
            // The waiting loop may already have timed out and gone away.
            let _ = sender.send(Completion::Finished(dissenter));
        }
    }
}

impl Drop for OperationCallback {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Completion::Abandoned);
        }
    }
}

/// Opens arbitration sessions. One implementation per OS backend.
pub trait DiskArbiter: Send + Sync {
    type Session: ArbitrationSession;

    /// Opens a new session, exclusively owned by the caller. The session is
    /// released when dropped.
    fn open_session(&self) -> Result<Self::Session, OperationError>;
}

/// An OS arbitration handle scoped to exactly one operation.
pub trait ArbitrationSession {
    /// Backend-specific handle to a resolved disk.
    type Disk;

    /// Attaches the session to the run loop its callbacks will stop.
    fn schedule(&mut self, run_loop: &RunLoop) -> Result<(), OperationError>;

    fn unschedule(&mut self);

    fn resolve_disk(&self, bsd_name: &str) -> Result<Self::Disk, OperationError>;

    fn describe(&self, disk: &Self::Disk) -> Result<DiskDescription, OperationError>;

    /// Starts unmounting every volume of the whole disk. The outcome is
    /// delivered through `callback`, possibly on another thread.
    fn unmount_whole(&self, disk: &Self::Disk, callback: OperationCallback);

    /// Starts ejecting the disk. The outcome is delivered through `callback`.
    fn eject(&self, disk: &Self::Disk, callback: OperationCallback);
}
