//! Drives a real helper over a Unix socket: client, server, authentication,
//! executor and a fake arbiter.
#![cfg(target_os = "linux")]

use diskgate_core::arbitration::Dissenter;
use diskgate_core::auth::{Authenticator, SigningRequirement};
use diskgate_core::client::HelperClient;
use diskgate_core::device::DeviceKind;
use diskgate_core::error::{ErrorKind, TransportError};
use diskgate_core::executor::Executor;
use diskgate_core::safety::SafetyGuard;
use diskgate_core::service::HelperService;
use diskgate_core::testing::{FakeArbiter, FakeDisk, FakeOutcome, StaticIdentitySource};
use diskgate_core::transport::client::ClientConfig;
use diskgate_core::transport::server::Server;
use diskgate_core::transport::Endpoint;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    endpoint: Endpoint,
    arbiter: FakeArbiter,
}

fn start_helper(source: StaticIdentitySource) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::for_service("io.diskgate.test", dir.path());
    let arbiter = FakeArbiter::new()
        .with_disk("sdb", FakeDisk::new(false, DeviceKind::Usb))
        .with_disk("sda", FakeDisk::new(true, DeviceKind::Internal))
        .with_disk(
            "sdc",
            FakeDisk::new(false, DeviceKind::Usb)
                .with_outcome(FakeOutcome::Dissent(Dissenter::new(16, "Device or resource busy"))),
        );

    let service = HelperService::new(
        Authenticator::new(source, SigningRequirement::default()),
        Executor::new(arbiter.clone(), SafetyGuard::default(), Duration::from_secs(5)),
    );
    let server = Server::bind(&endpoint, service).unwrap();
    thread::spawn(move || server.run());

    Harness {
        _dir: dir,
        endpoint,
        arbiter,
    }
}

fn client_config(endpoint: &Endpoint) -> ClientConfig {
    ClientConfig {
        endpoint: endpoint.clone(),
        reply_timeout: Duration::from_secs(10),
        startup_grace: Duration::ZERO,
        ..ClientConfig::default()
    }
}

fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[test]
fn trusted_client_round_trip() {
    let harness = start_helper(StaticIdentitySource::trusted());

    if running_as_root() {
        // The helper refuses callers that already run as root.
        let err = HelperClient::connect(client_config(&harness.endpoint), true)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TransportError::Refused(ErrorKind::RootCallerRejected)
        ));
        assert_eq!(harness.arbiter.sessions_opened(), 0);
        return;
    }

    let mut client = HelperClient::connect(client_config(&harness.endpoint), true).unwrap();

    let result = client.request_eject("sdb", DeviceKind::Usb);
    assert!(result.success, "{result:?}");
    assert_eq!(harness.arbiter.issued(), 1);

    let result = client.request_unmount("sda", DeviceKind::Usb);
    assert_eq!(result.error_kind, Some(ErrorKind::DestructiveOpOnInternalDevice));
    assert_eq!(harness.arbiter.issued(), 1);

    let result = client.request_unmount("sdc", DeviceKind::Usb);
    assert_eq!(result.error_kind, Some(ErrorKind::Dissent));
    assert_eq!(result.status_code, Some(16));
    assert_eq!(result.message.as_deref(), Some("Device or resource busy"));

    let result = client.request_unmount("sdz", DeviceKind::Usb);
    assert_eq!(result.error_kind, Some(ErrorKind::DiskResolveFailed));

    assert_eq!(harness.arbiter.open_sessions(), 0);
}

#[test]
fn untrusted_client_is_refused_before_any_disk_work() {
    let mut source = StaticIdentitySource::trusted();
    source.signature_valid = false;
    let harness = start_helper(source);

    let mut client = HelperClient::connect(client_config(&harness.endpoint), false).unwrap();
    let result = client.request_eject("sdb", DeviceKind::Usb);
    assert!(!result.success);
    let kind = result.error_kind.unwrap();
    assert!(matches!(
        kind,
        ErrorKind::InvalidSignature | ErrorKind::RootCallerRejected
    ));
    assert!(kind.is_final());
    assert_eq!(harness.arbiter.sessions_opened(), 0);
}

#[test]
fn second_helper_cannot_take_a_live_endpoint() {
    let harness = start_helper(StaticIdentitySource::trusted());
    let service = HelperService::new(
        Authenticator::new(StaticIdentitySource::trusted(), SigningRequirement::default()),
        Executor::new(FakeArbiter::new(), SafetyGuard::default(), Duration::from_secs(5)),
    );
    let err = Server::bind(&harness.endpoint, service).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::EndpointCreateFailed);
}

#[test]
fn absent_helper_is_an_endpoint_failure() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::for_service("io.diskgate.absent", dir.path());
    let err = HelperClient::connect(client_config(&endpoint), false)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::EndpointCreateFailed);
}
