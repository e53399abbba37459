//! Decides whether a destructive operation may touch a device.
//!
//! Classification reads the OS "is internal" property from a fresh
//! description and fails closed: a missing or mistyped property is an error,
//! never an implicit "external". The guard then refuses every internal
//! device, with one named exception for SD cards (see [`InternalSdPolicy`]).
//! The disk holding the running system is refused whatever its placement.
use crate::arbitration::{keys, DiskDescription, DiskOperation};
use crate::device::DeviceKind;
use crate::error::SafetyError;
use serde::Deserialize;

/// Where the OS says a device lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    Internal,
    External,
}

/// The guard's decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Allow,
    Reject,
}

/// Policy for SD cards whose reader the OS reports as internal.
///
/// Built-in SD slots are frequently wired as internal devices even though
/// the card itself is removable media.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalSdPolicy {
    /// Internal SD devices may be unmounted and ejected.
    #[default]
    Allow,
    /// Internal SD devices are treated like any other internal disk.
    Deny,
}

/// Reads the placement of a device from its description.
pub fn classify(bsd_name: &str, description: &DiskDescription) -> Result<Placement, SafetyError> {
    match description.bool(keys::DEVICE_INTERNAL) {
        Some(true) => Ok(Placement::Internal),
        Some(false) => Ok(Placement::External),
        None => Err(SafetyError::ClassificationUnavailable(bsd_name.to_string())),
    }
}

/// The disk safety validator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SafetyGuard {
    pub internal_sd: InternalSdPolicy,
}

impl SafetyGuard {
    pub fn new(internal_sd: InternalSdPolicy) -> Self {
        Self { internal_sd }
    }

    /// Decides whether `operation` may run on a device of this placement and
    /// kind.
    pub fn guard(&self, placement: Placement, kind: DeviceKind, operation: DiskOperation) -> Verdict {
        let verdict = match (placement, kind) {
            (Placement::External, _) => Verdict::Allow,
            (Placement::Internal, DeviceKind::Sd) if self.internal_sd == InternalSdPolicy::Allow => {
                Verdict::Allow
            }
            (Placement::Internal, _) => Verdict::Reject,
        };
        tracing::debug!(?placement, %kind, %operation, ?verdict, "safety guard");
        verdict
    }

    /// Classifies and guards in one step, as the executor needs it.
    pub fn check(
        &self,
        bsd_name: &str,
        description: &DiskDescription,
        kind: DeviceKind,
        operation: DiskOperation,
    ) -> Result<Placement, SafetyError> {
        if description.bool(keys::SYSTEM_DISK) == Some(true) {
            tracing::warn!(device = bsd_name, %operation, "refusing to touch the system disk");
            return Err(SafetyError::DestructiveOpOnInternalDevice(
                bsd_name.to_string(),
            ));
        }
        let placement = classify(bsd_name, description)?;
        match self.guard(placement, kind, operation) {
            Verdict::Allow => Ok(placement),
            Verdict::Reject => Err(SafetyError::DestructiveOpOnInternalDevice(
                bsd_name.to_string(),
            )),
        }
    }
}
