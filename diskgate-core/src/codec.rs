//! Fixed-capacity message codec.
//!
//! Every message is an `i32` opcode plus a payload buffer of exactly
//! [`PAYLOAD_CAPACITY`] bytes. The payload holds either the raw bytes of a
//! plain value or a NUL-terminated string in an otherwise zero-filled buffer.
//!
//! There is no type tag on the wire: whoever deserializes a payload must ask
//! for the same type that was serialized. Restricting values to
//! [`bytemuck::Pod`] keeps that contract memory-safe, since every bit pattern
//! is a valid instance of a `Pod` type. Enum-like fields are carried as
//! integers and validated with `TryFrom` after decoding.
use crate::device::{DeviceKind, MAX_BSD_NAME_LEN};
use crate::error::{CodecError, ErrorKind};
use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

/// Size of the payload buffer in bytes.
pub const PAYLOAD_CAPACITY: usize = 256;

/// Size of a full wire frame: the opcode followed by the payload.
pub const FRAME_LEN: usize = size_of::<i32>() + PAYLOAD_CAPACITY;

/// Bytes reserved for the message text inside a [`ReplyRecord`].
pub const REPLY_MESSAGE_LEN: usize = 128;

/// Request opcodes and their replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    /// Liveness probe. The payload is ignored.
    Ping = 1,
    Pong = 2,
    /// Unmount every volume of a whole disk. Payload: [`DiskRequestRecord`].
    Unmount = 16,
    /// Unmount and detach a disk. Payload: [`DiskRequestRecord`].
    Eject = 17,
    /// Result of an operation. Payload: [`ReplyRecord`].
    Reply = 32,
}

impl TryFrom<i32> for Opcode {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Ping),
            2 => Ok(Opcode::Pong),
            16 => Ok(Opcode::Unmount),
            17 => Ok(Opcode::Eject),
            32 => Ok(Opcode::Reply),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

/// One fixed-size unit of communication.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: i32,
    pub payload: [u8; PAYLOAD_CAPACITY],
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        f.debug_struct("Message")
            .field("opcode", &self.opcode)
            .field("payload_used", &used)
            .finish()
    }
}

impl Message {
    /// A message with an all-zero payload.
    pub fn empty(opcode: Opcode) -> Self {
        Self {
            opcode: opcode as i32,
            payload: [0; PAYLOAD_CAPACITY],
        }
    }

    pub fn opcode(&self) -> Result<Opcode, CodecError> {
        Opcode::try_from(self.opcode)
    }

    /// Encodes the message as a wire frame. The opcode is little-endian.
    pub fn to_frame(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..4].copy_from_slice(&self.opcode.to_le_bytes());
        frame[4..].copy_from_slice(&self.payload);
        frame
    }

    pub fn from_frame(frame: &[u8; FRAME_LEN]) -> Self {
        let mut opcode = [0u8; 4];
        opcode.copy_from_slice(&frame[..4]);
        let mut payload = [0u8; PAYLOAD_CAPACITY];
        payload.copy_from_slice(&frame[4..]);
        Self {
            opcode: i32::from_le_bytes(opcode),
            payload,
        }
    }
}

/// Copies the raw bytes of `value` into a fresh message.
///
/// Fails with [`CodecError::PayloadTooLarge`] before touching any buffer if
/// the value does not fit.
pub fn serialize<T: Pod>(opcode: Opcode, value: &T) -> Result<Message, CodecError> {
    let bytes = bytemuck::bytes_of(value);
    if bytes.len() > PAYLOAD_CAPACITY {
        return Err(CodecError::PayloadTooLarge {
            size: bytes.len(),
            capacity: PAYLOAD_CAPACITY,
        });
    }
    let mut message = Message::empty(opcode);
    message.payload[..bytes.len()].copy_from_slice(bytes);
    Ok(message)
}

/// Reinterprets the leading payload bytes as a `T`.
pub fn deserialize<T: Pod>(message: &Message) -> Result<T, CodecError> {
    let size = size_of::<T>();
    if size > PAYLOAD_CAPACITY {
        return Err(CodecError::PayloadTooLarge {
            size,
            capacity: PAYLOAD_CAPACITY,
        });
    }
    Ok(bytemuck::pod_read_unaligned(&message.payload[..size]))
}

/// Puts a NUL-terminated string in a fresh message.
pub fn serialize_str(opcode: Opcode, value: &str) -> Result<Message, CodecError> {
    let mut message = Message::empty(opcode);
    write_c_str(value, &mut message.payload)?;
    Ok(message)
}

/// Reads the payload up to its first terminator.
pub fn deserialize_str(message: &Message) -> Result<String, CodecError> {
    read_c_str(&message.payload).map(str::to_owned)
}

/// Writes `value` plus a terminator at the start of `buf`, zeroing the rest.
pub(crate) fn write_c_str(value: &str, buf: &mut [u8]) -> Result<(), CodecError> {
    let bytes = value.as_bytes();
    if bytes.contains(&0) {
        return Err(CodecError::InteriorNul);
    }
    if bytes.len() + 1 > buf.len() {
        return Err(CodecError::PayloadTooLarge {
            size: bytes.len() + 1,
            capacity: buf.len(),
        });
    }
    buf.fill(0);
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[bytes.len()] = 0;
    Ok(())
}

pub(crate) fn read_c_str(buf: &[u8]) -> Result<&str, CodecError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CodecError::Malformed("string is not terminated".into()))?;
    std::str::from_utf8(&buf[..end])
        .map_err(|e| CodecError::Malformed(format!("string is not UTF-8: {e}")))
}

/// Payload of an [`Opcode::Unmount`] or [`Opcode::Eject`] request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct DiskRequestRecord {
    /// A [`DeviceKind`] discriminant, as declared by the caller.
    pub device_kind: u32,
    /// NUL-terminated BSD name.
    pub bsd_name: [u8; MAX_BSD_NAME_LEN + 1],
}

impl DiskRequestRecord {
    pub fn new(bsd_name: &str, kind: DeviceKind) -> Result<Self, CodecError> {
        let mut record = Self::zeroed();
        record.device_kind = kind.into();
        write_c_str(bsd_name, &mut record.bsd_name)?;
        Ok(record)
    }

    pub fn bsd_name(&self) -> Result<&str, CodecError> {
        read_c_str(&self.bsd_name)
    }

    pub fn device_kind(&self) -> Result<DeviceKind, CodecError> {
        DeviceKind::try_from(self.device_kind)
    }
}

/// Payload of an [`Opcode::Reply`] message.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ReplyRecord {
    /// 1 on success, 0 on failure.
    pub success: u32,
    /// An [`ErrorKind`] discriminant, or 0 on success.
    pub error_kind: u32,
    /// 1 if `status` carries an OS status code.
    pub has_status: u32,
    pub status: i32,
    /// NUL-terminated, possibly empty message.
    pub message: [u8; REPLY_MESSAGE_LEN],
}

impl ReplyRecord {
    pub fn success() -> Self {
        let mut record = Self::zeroed();
        record.success = 1;
        record
    }

    /// A failure record. Messages longer than the record allows are cut at
    /// a character boundary.
    pub fn failure(kind: ErrorKind, status: Option<i32>, message: Option<&str>) -> Self {
        let mut record = Self::zeroed();
        record.error_kind = kind.into();
        if let Some(status) = status {
            record.has_status = 1;
            record.status = status;
        }
        if let Some(message) = message {
            let clean: String = message.chars().filter(|&c| c != '\0').collect();
            let cut = floor_char_boundary(&clean, REPLY_MESSAGE_LEN - 1);
            // Cannot fail: the text is NUL-free and leaves room for the terminator.
            let _ = write_c_str(&clean[..cut], &mut record.message);
        }
        record
    }

    pub fn is_success(&self) -> bool {
        self.success == 1
    }

    pub fn error_kind(&self) -> Result<Option<ErrorKind>, CodecError> {
        match self.error_kind {
            0 => Ok(None),
            kind => ErrorKind::try_from(kind).map(Some),
        }
    }

    pub fn status(&self) -> Option<i32> {
        (self.has_status == 1).then_some(self.status)
    }

    pub fn message(&self) -> Result<Option<&str>, CodecError> {
        let message = read_c_str(&self.message)?;
        Ok((!message.is_empty()).then_some(message))
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Oversized {
        bytes: [u8; PAYLOAD_CAPACITY + 1],
    }

    #[test]
    fn plain_values_round_trip() {
        let msg = serialize(Opcode::Ping, &0x1234_5678_9abc_def0_u64).unwrap();
        assert_eq!(deserialize::<u64>(&msg).unwrap(), 0x1234_5678_9abc_def0);

        let msg = serialize(Opcode::Ping, &-7_i32).unwrap();
        assert_eq!(deserialize::<i32>(&msg).unwrap(), -7);

        let full = [0xa5_u8; PAYLOAD_CAPACITY];
        let msg = serialize(Opcode::Ping, &full).unwrap();
        assert_eq!(deserialize::<[u8; PAYLOAD_CAPACITY]>(&msg).unwrap(), full);
    }

    #[test]
    fn oversized_values_are_refused() {
        let big = Oversized {
            bytes: [1; PAYLOAD_CAPACITY + 1],
        };
        assert_eq!(
            serialize(Opcode::Ping, &big),
            Err(CodecError::PayloadTooLarge {
                size: PAYLOAD_CAPACITY + 1,
                capacity: PAYLOAD_CAPACITY
            })
        );
        let msg = Message::empty(Opcode::Ping);
        assert!(matches!(
            deserialize::<Oversized>(&msg),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn strings_are_terminated_and_zero_padded() {
        let msg = serialize_str(Opcode::Ping, "disk5").unwrap();
        assert_eq!(&msg.payload[..6], b"disk5\0");
        assert!(msg.payload[6..].iter().all(|&b| b == 0));
        assert_eq!(deserialize_str(&msg).unwrap(), "disk5");
    }

    #[test]
    fn string_capacity_leaves_room_for_terminator() {
        let fits = "x".repeat(PAYLOAD_CAPACITY - 1);
        assert!(serialize_str(Opcode::Ping, &fits).is_ok());

        let too_long = "x".repeat(PAYLOAD_CAPACITY);
        assert!(matches!(
            serialize_str(Opcode::Ping, &too_long),
            Err(CodecError::PayloadTooLarge { .. })
        ));
        assert_eq!(
            serialize_str(Opcode::Ping, "a\0b"),
            Err(CodecError::InteriorNul)
        );
    }

    #[test]
    fn unterminated_or_invalid_strings_are_malformed() {
        let mut msg = Message::empty(Opcode::Ping);
        msg.payload.fill(b'a');
        assert!(matches!(
            deserialize_str(&msg),
            Err(CodecError::Malformed(_))
        ));

        let mut msg = Message::empty(Opcode::Ping);
        msg.payload[..2].copy_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            deserialize_str(&msg),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn frames_keep_opcode_and_payload() {
        let record = DiskRequestRecord::new("sdb", DeviceKind::Usb).unwrap();
        let msg = serialize(Opcode::Eject, &record).unwrap();
        let decoded = Message::from_frame(&msg.to_frame());
        assert_eq!(decoded, msg);
        assert_eq!(decoded.opcode().unwrap(), Opcode::Eject);

        let record: DiskRequestRecord = deserialize(&decoded).unwrap();
        assert_eq!(record.bsd_name().unwrap(), "sdb");
        assert_eq!(record.device_kind().unwrap(), DeviceKind::Usb);
    }

    #[test]
    fn unknown_opcodes_and_kinds_are_rejected() {
        let mut msg = Message::empty(Opcode::Ping);
        msg.opcode = 77;
        assert_eq!(msg.opcode(), Err(CodecError::UnknownOpcode(77)));

        let mut record = DiskRequestRecord::new("sdb", DeviceKind::Sd).unwrap();
        record.device_kind = 42;
        assert!(record.device_kind().is_err());
    }

    #[test]
    fn reply_messages_are_truncated_on_char_boundaries() {
        let long = "é".repeat(REPLY_MESSAGE_LEN);
        let record = ReplyRecord::failure(ErrorKind::Dissent, Some(16), Some(&long));
        let message = record.message().unwrap().unwrap();
        assert!(message.len() < REPLY_MESSAGE_LEN);
        assert!(message.chars().all(|c| c == 'é'));
        assert_eq!(record.status(), Some(16));
        assert_eq!(record.error_kind().unwrap(), Some(ErrorKind::Dissent));
        assert!(!record.is_success());

        let ok = ReplyRecord::success();
        assert!(ok.is_success());
        assert_eq!(ok.error_kind().unwrap(), None);
        assert_eq!(ok.message().unwrap(), None);
        assert_eq!(ok.status(), None);
    }
}
