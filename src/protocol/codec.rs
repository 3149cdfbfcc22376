//! Frame codec: `[type:1][flags:1][length:2 LE][payload:length]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Error, Result};
use super::message::{MessageFlags, MessageType, ProtocolMessage};
use super::{HEADER_SIZE, MAX_FRAME_PAYLOAD};

/// Decodes one frame from the front of `data`.
///
/// Returns the message and the number of bytes consumed. Bytes past the
/// declared payload are left for the caller.
pub fn decode_frame(data: &[u8]) -> Result<(ProtocolMessage, usize)> {
    if data.len() < HEADER_SIZE {
        return Err(Error::malformed(format!(
            "frame is {} bytes, header needs {}",
            data.len(),
            HEADER_SIZE
        )));
    }

    let mut header = &data[..HEADER_SIZE];
    let msg_type = MessageType::from(header.get_u8());
    let flags = MessageFlags(header.get_u8());
    let length = header.get_u16_le() as usize;

    let available = data.len() - HEADER_SIZE;
    if length > available {
        return Err(Error::malformed(format!(
            "declared payload length {} exceeds remaining {} bytes",
            length, available
        )));
    }

    let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + length]);
    Ok((
        ProtocolMessage { msg_type, flags, payload },
        HEADER_SIZE + length,
    ))
}

/// Encodes a frame; the length field always equals the payload length.
pub fn encode_frame(message: &ProtocolMessage) -> Result<Bytes> {
    let length = message.payload.len();
    if length > MAX_FRAME_PAYLOAD {
        return Err(Error::PayloadTooLarge { size: length, max: MAX_FRAME_PAYLOAD });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + length);
    buf.put_u8(message.msg_type.as_u8());
    buf.put_u8(message.flags.bits());
    buf.put_u16_le(length as u16);
    buf.extend_from_slice(&message.payload);
    Ok(buf.freeze())
}
