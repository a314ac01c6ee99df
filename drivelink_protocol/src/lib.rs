// drivelink_protocol — wire protocol for the simulation control server.
//
// This crate defines the message ids, payload types, framing and errors used
// by the control server (`drivelink_server`) and its clients over TCP. It is
// shared by both sides and knows nothing about sessions or the simulation.
//
// Module overview:
// - `types.rs`:    `ClientId` plus the camera-id and capture-sequence aliases.
// - `message.rs`:  `MessageId`, payload structs, and the `Request`/`Response`
//                  enums with their payload codecs.
// - `framing.rs`:  Fixed 12-byte little-endian header (id, client id, payload
//                  length) followed by the payload bytes.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **bincode payloads.** Fixed-width little-endian fields with no schema on
//   the wire; the message id alone determines the payload shape.
// - **Framing is payload-agnostic.** Unknown ids and broken payloads are
//   surfaced to the caller as well-formed frames, so a single bad message
//   never tears down a connection.
// - **No async runtime.** Plain `std::io::Read`/`Write`, usable with blocking
//   sockets and buffered wrappers alike.

pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::ProtocolError;
pub use framing::{Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE, MessageHeader, read_frame, write_frame};
pub use message::{
    AdvanceSynchronousSteppingRequest, ControlValues, MessageId, PROTOCOL_VERSION,
    RegisterCaptureCameraRequest, RegisterClientRequest, RegisterClientResponse, Request,
    ResetSimulationRequest, Response, SetAgentControlValuesRequest, SetSunSimulationRequest,
    SimulationConfiguration, SimulationGraphicsSettings, SunSimulationSettings, decode_payload,
};
pub use types::{CameraId, CaptureSequence, ClientId};
