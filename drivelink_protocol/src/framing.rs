// Fixed-header message framing over TCP.
//
// Every message on the wire is a 12-byte little-endian header followed by a
// payload whose shape is determined by the message id:
//
//   +----------------+----------------+-----------------+-------------+
//   | message_id u32 | client_id u32  | payload_len u32 | payload ... |
//   +----------------+----------------+-----------------+-------------+
//
// `read_frame` / `write_frame` only move bytes; they never look inside the
// payload, so a frame with an unknown id or an undecodable payload still
// reads cleanly and the caller decides what to drop. A `payload_len` above
// `MAX_PAYLOAD_SIZE` is rejected before allocating because the stream cannot
// be resynchronised after it.

use std::io::{Read, Write};

use crate::error::ProtocolError;
use crate::message::{MessageId, Request, Response};
use crate::types::ClientId;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Maximum accepted payload size (1 MiB). Camera labels are the only
/// variable-length field, so real payloads are a few hundred bytes at most.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// The fixed header in front of every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u32,
    pub client_id: ClientId,
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.message_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.client_id.0.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let field = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Self {
            message_id: field(0),
            client_id: ClientId(field(4)),
            payload_len: field(8),
        }
    }
}

/// A header plus its still-encoded payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub message_id: u32,
    pub client_id: ClientId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(client_id: ClientId, request: &Request) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            message_id: request.message_id().as_u32(),
            client_id,
            payload: request.encode_payload()?,
        })
    }

    pub fn response(client_id: ClientId, response: &Response) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            message_id: response.message_id().as_u32(),
            client_id,
            payload: response.encode_payload()?,
        })
    }

    /// The typed message id, or `UnknownMessageId` for ids this build does
    /// not know.
    pub fn id(&self) -> Result<MessageId, ProtocolError> {
        MessageId::try_from(self.message_id)
    }

    pub fn decode_request(&self) -> Result<Request, ProtocolError> {
        Request::decode(self.id()?, &self.payload)
    }

    pub fn decode_response(&self) -> Result<Response, ProtocolError> {
        Response::decode(self.id()?, &self.payload)
    }
}

/// Write a frame: header, then payload. Flushes the writer.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    let size = frame.payload.len();
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size });
    }
    let payload_len = u32::try_from(size).map_err(|_| ProtocolError::PayloadTooLarge { size })?;
    let header = MessageHeader {
        message_id: frame.message_id,
        client_id: frame.client_id,
        payload_len,
    };
    writer.write_all(&header.to_bytes())?;
    writer.write_all(&frame.payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Io(UnexpectedEof)` if the stream closes before or during a frame
/// and `PayloadTooLarge` if the header announces more than
/// `MAX_PAYLOAD_SIZE` bytes.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf)?;
    let header = MessageHeader::from_bytes(&header_buf);

    let size = header.payload_len as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size });
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload)?;

    Ok(Frame {
        message_id: header.message_id,
        client_id: header.client_id,
        payload,
    })
}
