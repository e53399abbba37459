//! In-memory stand-ins for the OS seams.
//!
//! [`FakeArbiter`] plays the disk arbitration layer and records what the
//! executor asked of it. [`StaticIdentitySource`] plays the code-signing
//! layer. Both are used by the unit tests and by the integration tests under
//! `tests/`, and they are handy for front ends that want a dry-run helper.
use crate::arbitration::{
    keys, ArbitrationSession, DiskArbiter, DiskDescription, Dissenter, OperationCallback,
    Property, RunLoop,
};
use crate::auth::{
    CodeIdentity, CodeIdentitySource, PeerCredentials, SigningInfo, EXPECTED_BUNDLE_ID,
    EXPECTED_TEAM_ID,
};
use crate::device::DeviceKind;
use crate::error::{OperationError, SecurityError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How a fake disk answers an unmount or eject request.
#[derive(Clone, Debug)]
pub enum FakeOutcome {
    Success,
    Dissent(Dissenter),
    /// Succeeds after the given delay.
    Delayed(Duration),
    /// Never completes. The callback is parked, not dropped.
    Never,
}

/// A disk known to a [`FakeArbiter`].
#[derive(Clone, Debug)]
pub struct FakeDisk {
    internal: Option<bool>,
    kind: DeviceKind,
    describable: bool,
    outcome: FakeOutcome,
}

impl FakeDisk {
    pub fn new(internal: bool, kind: DeviceKind) -> Self {
        Self {
            internal: Some(internal),
            kind,
            describable: true,
            outcome: FakeOutcome::Success,
        }
    }

    /// The description will lack the "is internal" property.
    pub fn unclassified(mut self) -> Self {
        self.internal = None;
        self
    }

    /// Fetching the description will fail.
    pub fn undescribable(mut self) -> Self {
        self.describable = false;
        self
    }

    pub fn with_outcome(mut self, outcome: FakeOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

#[derive(Default)]
struct Ledger {
    sessions_opened: AtomicUsize,
    open_sessions: AtomicUsize,
    scheduled_sessions: AtomicUsize,
    issued: AtomicUsize,
    parked: Mutex<Vec<OperationCallback>>,
}

/// A scripted disk arbitration layer.
#[derive(Clone, Default)]
pub struct FakeArbiter {
    disks: Arc<HashMap<String, FakeDisk>>,
    fail_sessions: bool,
    ledger: Arc<Ledger>,
}

impl FakeArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(mut self, bsd_name: &str, disk: FakeDisk) -> Self {
        let mut disks = (*self.disks).clone();
        disks.insert(bsd_name.to_string(), disk);
        self.disks = Arc::new(disks);
        self
    }

    /// Every `open_session` call will fail.
    pub fn failing_sessions(mut self) -> Self {
        self.fail_sessions = true;
        self
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.ledger.sessions_opened.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.ledger.open_sessions.load(Ordering::SeqCst)
    }

    /// Sessions scheduled and not yet unscheduled.
    pub fn scheduled_sessions(&self) -> usize {
        self.ledger.scheduled_sessions.load(Ordering::SeqCst)
    }

    /// Unmount and eject requests issued so far.
    pub fn issued(&self) -> usize {
        self.ledger.issued.load(Ordering::SeqCst)
    }
}

impl DiskArbiter for FakeArbiter {
    type Session = FakeSession;

    fn open_session(&self) -> Result<FakeSession, OperationError> {
        if self.fail_sessions {
            return Err(OperationError::SessionCreateFailed("scripted failure".into()));
        }
        self.ledger.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.ledger.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            disks: Arc::clone(&self.disks),
            ledger: Arc::clone(&self.ledger),
            scheduled: false,
        })
    }
}

pub struct FakeSession {
    disks: Arc<HashMap<String, FakeDisk>>,
    ledger: Arc<Ledger>,
    scheduled: bool,
}

impl FakeSession {
    fn finish(&self, disk: &FakeDisk, callback: OperationCallback) {
        self.ledger.issued.fetch_add(1, Ordering::SeqCst);
        match disk.outcome.clone() {
            FakeOutcome::Success => {
                thread::spawn(move || callback.complete(None));
            }
            FakeOutcome::Dissent(dissenter) => {
                thread::spawn(move || callback.complete(Some(dissenter)));
            }
            FakeOutcome::Delayed(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    callback.complete(None);
                });
            }
            FakeOutcome::Never => {
                if let Ok(mut parked) = self.ledger.parked.lock() {
                    parked.push(callback);
                }
            }
        }
    }
}

impl ArbitrationSession for FakeSession {
    type Disk = (String, FakeDisk);

    fn schedule(&mut self, _run_loop: &RunLoop) -> Result<(), OperationError> {
        self.scheduled = true;
        self.ledger.scheduled_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unschedule(&mut self) {
        if std::mem::take(&mut self.scheduled) {
            self.ledger.scheduled_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn resolve_disk(&self, bsd_name: &str) -> Result<Self::Disk, OperationError> {
        self.disks
            .get(bsd_name)
            .map(|disk| (bsd_name.to_string(), disk.clone()))
            .ok_or_else(|| OperationError::DiskResolveFailed {
                name: bsd_name.to_string(),
                reason: "no such disk".into(),
            })
    }

    fn describe(&self, (name, disk): &Self::Disk) -> Result<DiskDescription, OperationError> {
        if !disk.describable {
            return Err(OperationError::DescriptionFetchFailed {
                name: name.clone(),
                reason: "scripted failure".into(),
            });
        }
        let mut description = DiskDescription::new()
            .with(keys::BSD_NAME, Property::Text(name.clone()))
            .with(keys::MEDIA_KIND, Property::Text(disk.kind.as_str().into()))
            .with(keys::MEDIA_SIZE, Property::Integer(8 * 1024 * 1024 * 1024));
        if let Some(internal) = disk.internal {
            description.insert(keys::DEVICE_INTERNAL, Property::Bool(internal));
        }
        Ok(description)
    }

    fn unmount_whole(&self, (_, disk): &Self::Disk, callback: OperationCallback) {
        self.finish(disk, callback);
    }

    fn eject(&self, (_, disk): &Self::Disk, callback: OperationCallback) {
        self.finish(disk, callback);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.unschedule();
        self.ledger.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A code-signing layer that answers from fixed values.
#[derive(Clone, Debug)]
pub struct StaticIdentitySource {
    pub identity_available: bool,
    pub signature_valid: bool,
    pub bundle_id: String,
    pub team_id: String,
    lookups: Arc<AtomicUsize>,
}

impl StaticIdentitySource {
    /// A source that vouches for every caller as the expected application.
    pub fn trusted() -> Self {
        Self {
            identity_available: true,
            signature_valid: true,
            bundle_id: EXPECTED_BUNDLE_ID.to_string(),
            team_id: EXPECTED_TEAM_ID.to_string(),
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `code_identity` calls.
    pub fn lookups(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.lookups)
    }
}

impl CodeIdentitySource for StaticIdentitySource {
    fn code_identity(&self, peer: &PeerCredentials) -> Result<CodeIdentity, SecurityError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if !self.identity_available {
            return Err(SecurityError::InvalidSignature("no code identity".into()));
        }
        Ok(CodeIdentity {
            pid: peer.pid.unwrap_or_default(),
            executable: PathBuf::from("/usr/bin/diskgate-gui"),
            digest: "0".repeat(64),
        })
    }

    fn check_validity(&self, _identity: &CodeIdentity) -> Result<(), SecurityError> {
        if self.signature_valid {
            Ok(())
        } else {
            Err(SecurityError::InvalidSignature("signature check failed".into()))
        }
    }

    fn signing_info(&self, _identity: &CodeIdentity) -> Result<SigningInfo, SecurityError> {
        Ok(SigningInfo {
            bundle_id: self.bundle_id.clone(),
            team_id: self.team_id.clone(),
        })
    }
}
