//! Carries out one destructive disk operation.
//!
//! The executor walks a fixed sequence of states:
//!
//! ```text
//! Idle -> SessionOpen -> Scheduled -> DiskResolved -> DescriptionFetched
//!      -> SafetyChecked -> OperationIssued -> AwaitingCallback -> Completed
//! ```
//!
//! Any step may end the operation early with a typed error. The session is
//! held by a guard that unschedules and releases it on every exit path.
//! Exactly one OS request is issued per operation, and only after the safety
//! guard has passed.
//!
//! Only one operation runs at a time. A request arriving while another is in
//! flight is refused with [`OperationError::Busy`] instead of being queued.
//! An operation whose callback timed out stays in flight until the OS
//! finally answers or drops the callback.
use crate::arbitration::{ArbitrationSession, DiskArbiter, DiskOperation, RunLoop};
use crate::device::{validate_bsd_name, DeviceKind, MIN_BSD_NAME_LEN};
use crate::error::{ErrorKind, OperationError};
use crate::safety::SafetyGuard;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default upper bound on the wait for an OS completion callback.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress of one operation through the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    SessionOpen,
    Scheduled,
    DiskResolved,
    DescriptionFetched,
    SafetyChecked,
    OperationIssued,
    AwaitingCallback,
    Completed { success: bool },
}

/// A validated request to run one operation on one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation: DiskOperation,
    pub bsd_name: String,
    /// The kind the caller believes the device to be.
    pub declared_kind: DeviceKind,
}

/// The outcome of one operation, as handed back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub status_code: Option<i32>,
    pub message: Option<String>,
}

impl OperationResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error_kind: None,
            status_code: None,
            message: None,
        }
    }

    pub fn failure(kind: ErrorKind, status_code: Option<i32>, message: Option<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            status_code,
            message,
        }
    }
}

impl From<&OperationError> for OperationResult {
    fn from(err: &OperationError) -> Self {
        match err {
            OperationError::Dissent { status, message } => {
                Self::failure(ErrorKind::Dissent, Some(*status), Some(message.clone()))
            }
            other => Self::failure(other.kind(), None, Some(other.to_string())),
        }
    }
}

impl From<Result<(), OperationError>> for OperationResult {
    fn from(result: Result<(), OperationError>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(e) => Self::from(&e),
        }
    }
}

/// Keeps a session scheduled for as long as it lives.
struct ScheduledSession<S: ArbitrationSession> {
    session: S,
}

impl<S: ArbitrationSession> ScheduledSession<S> {
    fn schedule(mut session: S, run_loop: &RunLoop) -> Result<Self, OperationError> {
        session.schedule(run_loop)?;
        Ok(Self { session })
    }
}

impl<S: ArbitrationSession> Drop for ScheduledSession<S> {
    fn drop(&mut self) {
        self.session.unschedule();
        tracing::debug!("arbitration session unscheduled");
        // The session itself is released when `self.session` drops next.
    }
}

/// The single in-flight slot. Released when dropped.
struct FlightSlot {
    flag: Arc<AtomicBool>,
}

impl FlightSlot {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for FlightSlot {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs disk operations through a [`DiskArbiter`].
pub struct Executor<A> {
    arbiter: A,
    guard: SafetyGuard,
    callback_timeout: Duration,
    in_flight: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl<A: DiskArbiter> Executor<A> {
    pub fn new(arbiter: A, guard: SafetyGuard, callback_timeout: Duration) -> Self {
        Self {
            arbiter,
            guard,
            callback_timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn arbiter(&self) -> &A {
        &self.arbiter
    }

    /// Runs one operation to completion and reports its outcome.
    pub fn execute(&self, request: &OperationRequest) -> OperationResult {
        self.try_execute(request).into()
    }

    /// Runs one operation to completion.
    ///
    /// Blocks the calling thread until the OS completion callback arrives or
    /// the callback timeout expires.
    pub fn try_execute(&self, request: &OperationRequest) -> Result<(), OperationError> {
        // Validation touches no OS state and does not need the flight slot.
        validate_bsd_name(&request.bsd_name, MIN_BSD_NAME_LEN)?;

        let Some(flight) = FlightSlot::acquire(&self.in_flight) else {
            tracing::warn!(device = %request.bsd_name, "rejecting concurrent disk operation");
            return Err(OperationError::Busy);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(
            "disk_operation",
            id,
            operation = %request.operation,
            device = %request.bsd_name
        );
        let _entered = span.enter();

        let run_loop = RunLoop::new();
        let mut state = OperationState::Idle;
        let result = self.run(request, &run_loop, &mut state);
        advance(&mut state, OperationState::Completed {
            success: result.is_ok(),
        });
        if matches!(result, Err(OperationError::CallbackTimeout(_))) {
            hold_until_late_completion(run_loop, flight);
        }
        match &result {
            Ok(()) => tracing::info!("disk operation succeeded"),
            Err(e) => tracing::warn!(error = %e, "disk operation failed"),
        }
        result
    }

    fn run(
        &self,
        request: &OperationRequest,
        run_loop: &RunLoop,
        state: &mut OperationState,
    ) -> Result<(), OperationError> {
        let session = self.arbiter.open_session()?;
        advance(state, OperationState::SessionOpen);

        let scheduled = ScheduledSession::schedule(session, run_loop)?;
        advance(state, OperationState::Scheduled);
        let session = &scheduled.session;

        let disk = session.resolve_disk(&request.bsd_name)?;
        advance(state, OperationState::DiskResolved);

        let description = session.describe(&disk)?;
        advance(state, OperationState::DescriptionFetched);

        let kind = effective_kind(request, description.media_kind());
        self.guard
            .check(&request.bsd_name, &description, kind, request.operation)?;
        advance(state, OperationState::SafetyChecked);

        let callback = run_loop.callback(request.operation);
        match request.operation {
            DiskOperation::Unmount => session.unmount_whole(&disk, callback),
            DiskOperation::Eject => session.eject(&disk, callback),
        }
        advance(state, OperationState::OperationIssued);

        advance(state, OperationState::AwaitingCallback);
        run_loop.run_until_complete(self.callback_timeout)
    }
}

/// Keeps the flight slot taken until the timed-out operation's callback
/// finally fires, so no second OS request overlaps the first.
fn hold_until_late_completion(run_loop: RunLoop, flight: FlightSlot) {
    let spawned = thread::Builder::new()
        .name("diskgate-late-callback".into())
        .spawn(move || {
            run_loop.wait_for_late_completion();
            tracing::info!("timed-out disk operation finally completed");
            drop(flight);
        });
    if let Err(e) = spawned {
        // The slot went down with the closure; nothing is left to wait on.
        tracing::error!(error = %e, "could not watch timed-out disk operation");
    }
}

/// The kind the safety guard should judge.
///
/// The fresh OS report wins over the caller's declaration. The SD exemption
/// is only granted when both agree on SD, so a caller cannot talk an
/// internal disk into it.
fn effective_kind(request: &OperationRequest, reported: Option<DeviceKind>) -> DeviceKind {
    match reported {
        Some(reported) => {
            if reported != request.declared_kind {
                tracing::warn!(
                    declared = %request.declared_kind,
                    %reported,
                    "caller declared a different device kind"
                );
            }
            if reported == DeviceKind::Sd && request.declared_kind != DeviceKind::Sd {
                DeviceKind::Other
            } else {
                reported
            }
        }
        None => {
            if request.declared_kind == DeviceKind::Sd {
                // An unconfirmed SD claim earns no exemption.
                DeviceKind::Other
            } else {
                request.declared_kind
            }
        }
    }
}

fn advance(state: &mut OperationState, next: OperationState) {
    tracing::debug!(from = ?*state, to = ?next, "state transition");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::Dissenter;
    use crate::error::SafetyError;
    use crate::safety::InternalSdPolicy;
    use crate::testing::{FakeArbiter, FakeDisk, FakeOutcome};
    use std::sync::Arc;
    use std::thread;

    fn executor(arbiter: FakeArbiter) -> Executor<FakeArbiter> {
        Executor::new(arbiter, SafetyGuard::default(), Duration::from_secs(5))
    }

    fn request(operation: DiskOperation, name: &str, kind: DeviceKind) -> OperationRequest {
        OperationRequest {
            operation,
            bsd_name: name.to_string(),
            declared_kind: kind,
        }
    }

    #[test]
    fn internal_usb_disk_is_refused_without_an_os_call() {
        let arbiter = FakeArbiter::new().with_disk("disk2", FakeDisk::new(true, DeviceKind::Usb));
        let exec = executor(arbiter);
        let result = exec.execute(&request(DiskOperation::Unmount, "disk2", DeviceKind::Usb));
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::DestructiveOpOnInternalDevice));
        assert_eq!(exec.arbiter().issued(), 0);
        assert_eq!(exec.arbiter().open_sessions(), 0);
    }

    #[test]
    fn external_disk_unmounts() {
        let arbiter = FakeArbiter::new().with_disk("disk5", FakeDisk::new(false, DeviceKind::Usb));
        let exec = executor(arbiter);
        let result = exec.execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb));
        assert_eq!(result, OperationResult::success());
        assert_eq!(exec.arbiter().issued(), 1);
        assert_eq!(exec.arbiter().sessions_opened(), 1);
        assert_eq!(exec.arbiter().open_sessions(), 0);
        assert_eq!(exec.arbiter().scheduled_sessions(), 0);
    }

    #[test]
    fn dissenter_is_reported_with_status_and_message() {
        let arbiter = FakeArbiter::new().with_disk(
            "disk5",
            FakeDisk::new(false, DeviceKind::Usb)
                .with_outcome(FakeOutcome::Dissent(Dissenter::new(99, "Volume busy"))),
        );
        let exec = executor(arbiter);
        let result = exec.execute(&request(DiskOperation::Eject, "disk5", DeviceKind::Usb));
        assert_eq!(
            result,
            OperationResult::failure(ErrorKind::Dissent, Some(99), Some("Volume busy".into()))
        );
        assert_eq!(exec.arbiter().open_sessions(), 0);
    }

    #[test]
    fn undecodable_dissent_message_reads_unavailable() {
        let arbiter = FakeArbiter::new().with_disk(
            "disk5",
            FakeDisk::new(false, DeviceKind::Usb).with_outcome(FakeOutcome::Dissent(Dissenter {
                status: 99,
                message: Some(vec![0xc0, 0xff]),
            })),
        );
        let exec = executor(arbiter);
        let result = exec.execute(&request(DiskOperation::Eject, "disk5", DeviceKind::Usb));
        assert_eq!(result.status_code, Some(99));
        assert_eq!(result.message.as_deref(), Some("unavailable"));
    }

    #[test]
    fn short_names_fail_before_any_session() {
        let exec = executor(FakeArbiter::new());
        for name in ["", "d"] {
            let err = exec
                .try_execute(&request(DiskOperation::Eject, name, DeviceKind::Usb))
                .unwrap_err();
            assert_eq!(err, OperationError::MalformedDeviceName(name.into()));
        }
        assert_eq!(exec.arbiter().sessions_opened(), 0);
    }

    #[test]
    fn each_setup_failure_has_its_own_kind_and_releases_the_session() {
        let exec = executor(FakeArbiter::new().failing_sessions());
        let err = exec
            .try_execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionCreateFailed);

        let exec = executor(FakeArbiter::new());
        let err = exec
            .try_execute(&request(DiskOperation::Unmount, "disk9", DeviceKind::Usb))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiskResolveFailed);
        assert_eq!(exec.arbiter().open_sessions(), 0);
        assert_eq!(exec.arbiter().scheduled_sessions(), 0);

        let exec = executor(
            FakeArbiter::new().with_disk("disk5", FakeDisk::new(false, DeviceKind::Usb).undescribable()),
        );
        let err = exec
            .try_execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DescriptionFetchFailed);
        assert_eq!(exec.arbiter().open_sessions(), 0);
    }

    #[test]
    fn unclassifiable_disk_is_refused() {
        let exec = executor(
            FakeArbiter::new().with_disk("disk5", FakeDisk::new(false, DeviceKind::Usb).unclassified()),
        );
        let err = exec
            .try_execute(&request(DiskOperation::Eject, "disk5", DeviceKind::Usb))
            .unwrap_err();
        assert_eq!(
            err,
            OperationError::Safety(SafetyError::ClassificationUnavailable("disk5".into()))
        );
        assert_eq!(exec.arbiter().issued(), 0);
    }

    #[test]
    fn internal_sd_follows_policy_and_needs_agreement() {
        let disk = || FakeDisk::new(true, DeviceKind::Sd);

        let exec = executor(FakeArbiter::new().with_disk("mmcblk0", disk()));
        assert!(exec.execute(&request(DiskOperation::Eject, "mmcblk0", DeviceKind::Sd)).success);

        // Declared as something else: no exemption.
        let exec = executor(FakeArbiter::new().with_disk("mmcblk0", disk()));
        let result = exec.execute(&request(DiskOperation::Eject, "mmcblk0", DeviceKind::Other));
        assert_eq!(result.error_kind, Some(ErrorKind::DestructiveOpOnInternalDevice));

        let exec = Executor::new(
            FakeArbiter::new().with_disk("mmcblk0", disk()),
            SafetyGuard::new(InternalSdPolicy::Deny),
            Duration::from_secs(5),
        );
        let result = exec.execute(&request(DiskOperation::Eject, "mmcblk0", DeviceKind::Sd));
        assert_eq!(result.error_kind, Some(ErrorKind::DestructiveOpOnInternalDevice));
        assert_eq!(exec.arbiter().issued(), 0);
    }

    #[test]
    fn declared_sd_cannot_override_reported_usb() {
        let exec = executor(FakeArbiter::new().with_disk("disk2", FakeDisk::new(true, DeviceKind::Usb)));
        let result = exec.execute(&request(DiskOperation::Unmount, "disk2", DeviceKind::Sd));
        assert_eq!(result.error_kind, Some(ErrorKind::DestructiveOpOnInternalDevice));
    }

    #[test]
    fn silent_os_times_out() {
        let arbiter = FakeArbiter::new().with_disk(
            "disk5",
            FakeDisk::new(false, DeviceKind::Usb).with_outcome(FakeOutcome::Never),
        );
        let exec = Executor::new(arbiter, SafetyGuard::default(), Duration::from_millis(50));
        let err = exec
            .try_execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb))
            .unwrap_err();
        assert_eq!(err, OperationError::CallbackTimeout(Duration::from_millis(50)));
        assert_eq!(exec.arbiter().open_sessions(), 0);
    }

    #[test]
    fn timed_out_operation_keeps_the_slot_until_its_callback_fires() {
        let arbiter = FakeArbiter::new().with_disk(
            "disk5",
            FakeDisk::new(false, DeviceKind::Usb).with_outcome(FakeOutcome::Delayed(Duration::from_millis(800))),
        );
        let exec = Executor::new(arbiter, SafetyGuard::default(), Duration::from_millis(50));
        let eject = request(DiskOperation::Eject, "disk5", DeviceKind::Usb);

        assert_eq!(
            exec.try_execute(&eject),
            Err(OperationError::CallbackTimeout(Duration::from_millis(50)))
        );
        // The first eject is still running in the OS.
        assert_eq!(exec.try_execute(&eject), Err(OperationError::Busy));
        assert_eq!(exec.arbiter().issued(), 1);

        let mut waited = Duration::ZERO;
        let result = loop {
            match exec.try_execute(&eject) {
                Err(OperationError::Busy) if waited < Duration::from_secs(10) => {
                    thread::sleep(Duration::from_millis(50));
                    waited += Duration::from_millis(50);
                }
                other => break other,
            }
        };
        // Once the late callback fired, the slot was free again; this
        // attempt itself then timed out on the same delayed outcome.
        assert_eq!(result, Err(OperationError::CallbackTimeout(Duration::from_millis(50))));
        assert!(waited >= Duration::from_millis(500));
        assert_eq!(exec.arbiter().issued(), 2);
    }

    #[test]
    fn concurrent_request_is_busy() {
        let arbiter = FakeArbiter::new().with_disk(
            "disk5",
            FakeDisk::new(false, DeviceKind::Usb).with_outcome(FakeOutcome::Delayed(Duration::from_millis(300))),
        );
        let exec = Arc::new(executor(arbiter));

        let first = {
            let exec = Arc::clone(&exec);
            thread::spawn(move || exec.execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb)))
        };
        // Wait until the first operation is parked on its callback.
        while exec.arbiter().issued() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        let second = exec.try_execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb));
        assert_eq!(second, Err(OperationError::Busy));

        assert!(first.join().unwrap().success);
        // The slot is free again.
        assert!(exec.execute(&request(DiskOperation::Unmount, "disk5", DeviceKind::Usb)).success);
    }
}
