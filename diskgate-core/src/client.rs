//! The interface front ends use to ask the helper for a destructive
//! operation.
//!
//! Requests are validated locally before anything is sent, and every failure,
//! local or remote, comes back as a plain [`OperationResult`].
use crate::arbitration::DiskOperation;
use crate::codec::{serialize, DiskRequestRecord, Opcode};
use crate::device::{validate_bsd_name, DeviceKind, MIN_BSD_NAME_LEN};
use crate::error::{ErrorKind, TransportError};
use crate::executor::OperationResult;
use crate::service::decode_result;
use crate::transport::client::{Client, ClientConfig};

/// A synchronous client of the privileged helper.
pub struct HelperClient {
    client: Client,
}

impl HelperClient {
    /// Connects to the helper. With `probe` set, also waits out the startup
    /// grace period and checks the helper answers a ping.
    pub fn connect(config: ClientConfig, probe: bool) -> Result<Self, TransportError> {
        let mut client = Client::connect(config)?;
        if probe {
            client.probe()?;
        }
        Ok(Self { client })
    }

    /// Checks the helper is alive and willing to talk to us.
    pub fn ping(&mut self) -> Result<(), TransportError> {
        self.client.probe()
    }

    pub fn request_unmount(&mut self, bsd_name: &str, kind: DeviceKind) -> OperationResult {
        self.request_destructive_op(DiskOperation::Unmount, bsd_name, kind)
    }

    pub fn request_eject(&mut self, bsd_name: &str, kind: DeviceKind) -> OperationResult {
        self.request_destructive_op(DiskOperation::Eject, bsd_name, kind)
    }

    /// Asks the helper to run `operation` on `bsd_name` and waits for the
    /// outcome.
    ///
    /// Transport failures are reported like any other failure. A result
    /// whose error kind [`is_final`](ErrorKind::is_final) must not be
    /// retried.
    pub fn request_destructive_op(
        &mut self,
        operation: DiskOperation,
        bsd_name: &str,
        kind: DeviceKind,
    ) -> OperationResult {
        if let Err(e) = validate_bsd_name(bsd_name, MIN_BSD_NAME_LEN) {
            return OperationResult::from(&e);
        }

        let opcode = match operation {
            DiskOperation::Unmount => Opcode::Unmount,
            DiskOperation::Eject => Opcode::Eject,
        };
        let request = match DiskRequestRecord::new(bsd_name, kind)
            .and_then(|record| serialize(opcode, &record))
        {
            Ok(request) => request,
            Err(e) => return OperationResult::failure(e.kind(), None, Some(e.to_string())),
        };

        tracing::debug!(%operation, device = bsd_name, %kind, "sending request to helper");
        let reply = match self.client.send_with_reply(&request) {
            Ok(reply) => reply,
            Err(e) => return transport_failure(&e),
        };
        decode_result(&reply).unwrap_or_else(|e| {
            OperationResult::failure(ErrorKind::MalformedMessage, None, Some(e.to_string()))
        })
    }
}

fn transport_failure(err: &TransportError) -> OperationResult {
    tracing::warn!(error = %err, "helper request failed");
    OperationResult::failure(err.kind(), None, Some(err.to_string()))
}
