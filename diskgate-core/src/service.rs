//! The privileged helper's message handler.
//!
//! Every inbound message goes through the same pipeline: authenticate the
//! peer, decode the request, run the executor, encode the result. Nothing
//! past authentication runs for a caller that fails it, whatever the
//! payload says.
use crate::arbitration::{DiskArbiter, DiskOperation};
use crate::auth::{Authenticator, CodeIdentitySource, PeerContext, PeerCredentials};
use crate::codec::{deserialize, serialize, DiskRequestRecord, Message, Opcode, ReplyRecord};
use crate::error::{CodecError, ErrorKind};
use crate::executor::{Executor, OperationRequest, OperationResult};
use crate::transport::server::{failure_reply, MessageHandler};

pub struct HelperService<A, S> {
    authenticator: Authenticator<S>,
    executor: Executor<A>,
}

impl<A, S> HelperService<A, S>
where
    A: DiskArbiter + 'static,
    S: CodeIdentitySource + 'static,
{
    pub fn new(authenticator: Authenticator<S>, executor: Executor<A>) -> Self {
        Self {
            authenticator,
            executor,
        }
    }

    pub fn executor(&self) -> &Executor<A> {
        &self.executor
    }

    fn decode_request(request: &Message) -> Result<Option<OperationRequest>, CodecError> {
        let operation = match request.opcode()? {
            Opcode::Ping => return Ok(None),
            Opcode::Unmount => DiskOperation::Unmount,
            Opcode::Eject => DiskOperation::Eject,
            other => {
                return Err(CodecError::Malformed(format!(
                    "{other:?} is not a request opcode"
                )));
            }
        };
        let record: DiskRequestRecord = deserialize(request)?;
        Ok(Some(OperationRequest {
            operation,
            bsd_name: record.bsd_name()?.to_string(),
            declared_kind: record.device_kind()?,
        }))
    }
}

impl<A, S> MessageHandler for HelperService<A, S>
where
    A: DiskArbiter + 'static,
    S: CodeIdentitySource + 'static,
{
    type Peer = PeerContext;

    fn connect(&self, credentials: PeerCredentials) -> PeerContext {
        let mut peer = PeerContext::new(credentials);
        self.authenticator.pin(&mut peer);
        peer
    }

    fn handle(&self, peer: &mut PeerContext, request: &Message) -> Message {
        if let Err(e) = self.authenticator.authenticate_peer(peer) {
            return failure_reply(e.kind(), &e.to_string());
        }
        let uid = peer.credentials().uid;

        let operation = match Self::decode_request(request) {
            Ok(Some(operation)) => operation,
            Ok(None) => return Message::empty(Opcode::Pong),
            Err(e) => {
                tracing::warn!(uid, error = %e, "rejecting malformed request");
                return failure_reply(e.kind(), &e.to_string());
            }
        };

        tracing::info!(
            uid,
            operation = %operation.operation,
            device = %operation.bsd_name,
            kind = %operation.declared_kind,
            "accepted disk operation request"
        );
        encode_result(&self.executor.execute(&operation))
    }
}

/// Encodes an operation result as a reply message.
pub fn encode_result(result: &OperationResult) -> Message {
    let record = if result.success {
        ReplyRecord::success()
    } else {
        ReplyRecord::failure(
            result.error_kind.unwrap_or(ErrorKind::Internal),
            result.status_code,
            result.message.as_deref(),
        )
    };
    serialize(Opcode::Reply, &record)
        .unwrap_or_else(|e| failure_reply(ErrorKind::Internal, &e.to_string()))
}

/// Decodes a reply message into an operation result.
pub fn decode_result(reply: &Message) -> Result<OperationResult, CodecError> {
    if reply.opcode()? != Opcode::Reply {
        return Err(CodecError::Malformed(format!(
            "expected a reply, got opcode {}",
            reply.opcode
        )));
    }
    let record: ReplyRecord = deserialize(reply)?;
    if record.is_success() {
        return Ok(OperationResult::success());
    }
    Ok(OperationResult::failure(
        record.error_kind()?.unwrap_or(ErrorKind::Internal),
        record.status(),
        record.message()?.map(str::to_owned),
    ))
}
