// Protocol messages for client-server communication.
//
// Every message is identified by a stable `MessageId`. Requests travel
// client → server, responses server → client; each request produces at most
// one response. Payloads are plain structs encoded with bincode's fixed-width
// little-endian layout (see `framing.rs` for the header that precedes them).
//
// Two enums wrap the payload structs:
// - `Request`:  everything a client may send.
// - `Response`: everything the server may answer.
//
// The server dispatcher does not decode into these enums; it looks up a
// handler by `MessageId` and decodes the single payload type it expects with
// `decode_payload`. The enums are the convenient form for clients and for the
// connection-level requests (register/unregister).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{CameraId, CaptureSequence, ClientId};

/// Protocol version advertised by both sides during registration.
pub const PROTOCOL_VERSION: u32 = 1;

/// Stable wire identifiers for every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageId {
    Undefined = 0,
    RegisterClientRequest = 1,
    RegisterClientResponse = 2,
    UnregisterClientRequest = 3,
    UnregisterClientResponse = 4,
    RegisterCaptureCameraRequest = 5,
    RegisterCaptureCameraResponse = 6,
    RequestAgentControlRequest = 7,
    RequestAgentControlResponse = 8,
    ReleaseAgentControlRequest = 9,
    ReleaseAgentControlResponse = 10,
    ResetAgentRequest = 11,
    ResetAgentResponse = 12,
    SetAgentControlValuesRequest = 13,
    ActivateSynchronousSteppingRequest = 14,
    ActivateSynchronousSteppingResponse = 15,
    DeactivateSynchronousSteppingRequest = 16,
    DeactivateSynchronousSteppingResponse = 17,
    AdvanceSynchronousSteppingRequest = 18,
    AdvanceSynchronousSteppingResponse = 19,
    ResetSimulationRequest = 20,
    ResetSimulationResponse = 21,
    SetSunSimulationRequest = 22,
    SetSunSimulationResponse = 23,
}

impl MessageId {
    const ALL: [MessageId; 24] = [
        MessageId::Undefined,
        MessageId::RegisterClientRequest,
        MessageId::RegisterClientResponse,
        MessageId::UnregisterClientRequest,
        MessageId::UnregisterClientResponse,
        MessageId::RegisterCaptureCameraRequest,
        MessageId::RegisterCaptureCameraResponse,
        MessageId::RequestAgentControlRequest,
        MessageId::RequestAgentControlResponse,
        MessageId::ReleaseAgentControlRequest,
        MessageId::ReleaseAgentControlResponse,
        MessageId::ResetAgentRequest,
        MessageId::ResetAgentResponse,
        MessageId::SetAgentControlValuesRequest,
        MessageId::ActivateSynchronousSteppingRequest,
        MessageId::ActivateSynchronousSteppingResponse,
        MessageId::DeactivateSynchronousSteppingRequest,
        MessageId::DeactivateSynchronousSteppingResponse,
        MessageId::AdvanceSynchronousSteppingRequest,
        MessageId::AdvanceSynchronousSteppingResponse,
        MessageId::ResetSimulationRequest,
        MessageId::ResetSimulationResponse,
        MessageId::SetSunSimulationRequest,
        MessageId::SetSunSimulationResponse,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageId {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        MessageId::ALL
            .get(raw as usize)
            .copied()
            .ok_or(ProtocolError::UnknownMessageId(raw))
    }
}

// ---------------------------------------------------------------------------
// Shared payload pieces
// ---------------------------------------------------------------------------

/// Simulation parameters a master client supplies at registration and on
/// `ResetSimulation`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfiguration {
    pub seed: u32,
    pub time_dilation: f32,
    pub agent_start_location: f32,
}

/// Rendering quality knobs forwarded verbatim to the simulation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationGraphicsSettings {
    pub is_fullscreen: bool,
    pub vsync_enabled: bool,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub resolution_scale: f32,
    pub texture_quality: u8,
    pub shadow_quality: u8,
    pub effect_quality: u8,
    pub post_process_level: u8,
    pub motion_blur_strength: u8,
    pub view_distance: u32,
    pub ambient_occlusion: u8,
}

/// Time of day for the sun simulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SunSimulationSettings {
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

/// Driving inputs applied to the controlled agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlValues {
    pub steering: f32,
    pub throttle: f32,
    pub brake: f32,
    pub handbrake: bool,
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterClientRequest {
    pub client_protocol_version: u32,
    pub request_master_role: bool,
    pub configuration: SimulationConfiguration,
    pub graphics_settings: SimulationGraphicsSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterCaptureCameraRequest {
    pub horizontal_field_of_view: f32,
    pub capture_width: u32,
    pub capture_height: u32,
    pub relative_position: [f32; 3],
    pub relative_rotation: [f32; 3],
    pub camera_label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetAgentControlValuesRequest {
    pub controls: ControlValues,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdvanceSynchronousSteppingRequest {
    /// Simulated seconds to run before pausing again.
    pub time_step: f32,
    pub controls: ControlValues,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResetSimulationRequest {
    pub configuration: SimulationConfiguration,
    pub graphics_settings: SimulationGraphicsSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetSunSimulationRequest {
    pub settings: SunSimulationSettings,
}

/// Requests sent by a client to the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    RegisterClient(RegisterClientRequest),
    UnregisterClient,
    RegisterCaptureCamera(RegisterCaptureCameraRequest),
    RequestAgentControl,
    ReleaseAgentControl,
    ResetAgent,
    SetAgentControlValues(SetAgentControlValuesRequest),
    ActivateSynchronousStepping,
    DeactivateSynchronousStepping,
    AdvanceSynchronousStepping(AdvanceSynchronousSteppingRequest),
    ResetSimulation(ResetSimulationRequest),
    SetSunSimulation(SetSunSimulationRequest),
}

impl Request {
    pub fn message_id(&self) -> MessageId {
        match self {
            Request::RegisterClient(_) => MessageId::RegisterClientRequest,
            Request::UnregisterClient => MessageId::UnregisterClientRequest,
            Request::RegisterCaptureCamera(_) => MessageId::RegisterCaptureCameraRequest,
            Request::RequestAgentControl => MessageId::RequestAgentControlRequest,
            Request::ReleaseAgentControl => MessageId::ReleaseAgentControlRequest,
            Request::ResetAgent => MessageId::ResetAgentRequest,
            Request::SetAgentControlValues(_) => MessageId::SetAgentControlValuesRequest,
            Request::ActivateSynchronousStepping => MessageId::ActivateSynchronousSteppingRequest,
            Request::DeactivateSynchronousStepping => {
                MessageId::DeactivateSynchronousSteppingRequest
            }
            Request::AdvanceSynchronousStepping(_) => MessageId::AdvanceSynchronousSteppingRequest,
            Request::ResetSimulation(_) => MessageId::ResetSimulationRequest,
            Request::SetSunSimulation(_) => MessageId::SetSunSimulationRequest,
        }
    }

    /// Encode the payload only (no header). Payload-less requests encode to
    /// an empty buffer.
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Request::RegisterClient(req) => bincode::serialize(req)?,
            Request::RegisterCaptureCamera(req) => bincode::serialize(req)?,
            Request::SetAgentControlValues(req) => bincode::serialize(req)?,
            Request::AdvanceSynchronousStepping(req) => bincode::serialize(req)?,
            Request::ResetSimulation(req) => bincode::serialize(req)?,
            Request::SetSunSimulation(req) => bincode::serialize(req)?,
            Request::UnregisterClient
            | Request::RequestAgentControl
            | Request::ReleaseAgentControl
            | Request::ResetAgent
            | Request::ActivateSynchronousStepping
            | Request::DeactivateSynchronousStepping => Vec::new(),
        };
        Ok(bytes)
    }

    /// Decode a request from its message id and payload.
    pub fn decode(id: MessageId, payload: &[u8]) -> Result<Request, ProtocolError> {
        let request = match id {
            MessageId::RegisterClientRequest => Request::RegisterClient(decode_payload(payload)?),
            MessageId::UnregisterClientRequest => Request::UnregisterClient,
            MessageId::RegisterCaptureCameraRequest => {
                Request::RegisterCaptureCamera(decode_payload(payload)?)
            }
            MessageId::RequestAgentControlRequest => Request::RequestAgentControl,
            MessageId::ReleaseAgentControlRequest => Request::ReleaseAgentControl,
            MessageId::ResetAgentRequest => Request::ResetAgent,
            MessageId::SetAgentControlValuesRequest => {
                Request::SetAgentControlValues(decode_payload(payload)?)
            }
            MessageId::ActivateSynchronousSteppingRequest => Request::ActivateSynchronousStepping,
            MessageId::DeactivateSynchronousSteppingRequest => {
                Request::DeactivateSynchronousStepping
            }
            MessageId::AdvanceSynchronousSteppingRequest => {
                Request::AdvanceSynchronousStepping(decode_payload(payload)?)
            }
            MessageId::ResetSimulationRequest => Request::ResetSimulation(decode_payload(payload)?),
            MessageId::SetSunSimulationRequest => {
                Request::SetSunSimulation(decode_payload(payload)?)
            }
            other => return Err(ProtocolError::WrongDirection(other.as_u32(), "request")),
        };
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterClientResponse {
    pub client_id: ClientId,
    pub granted_master_role: bool,
    pub server_protocol_version: u32,
    pub max_supported_cameras: u32,
    pub max_capture_resolution: u32,
    pub inactivity_timeout_ms: u32,
}

/// Responses sent by the server to a client.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    RegisterClient(RegisterClientResponse),
    UnregisterClient,
    RegisterCaptureCamera { camera_id: CameraId },
    RequestAgentControl { control_granted: bool },
    ReleaseAgentControl { control_released: bool },
    ResetAgent { success: bool },
    ActivateSynchronousStepping { result: bool },
    DeactivateSynchronousStepping { result: bool },
    AdvanceSynchronousStepping { sequence_number: CaptureSequence },
    ResetSimulation { success: bool },
    SetSunSimulation { success: bool },
}

impl Response {
    pub fn message_id(&self) -> MessageId {
        match self {
            Response::RegisterClient(_) => MessageId::RegisterClientResponse,
            Response::UnregisterClient => MessageId::UnregisterClientResponse,
            Response::RegisterCaptureCamera { .. } => MessageId::RegisterCaptureCameraResponse,
            Response::RequestAgentControl { .. } => MessageId::RequestAgentControlResponse,
            Response::ReleaseAgentControl { .. } => MessageId::ReleaseAgentControlResponse,
            Response::ResetAgent { .. } => MessageId::ResetAgentResponse,
            Response::ActivateSynchronousStepping { .. } => {
                MessageId::ActivateSynchronousSteppingResponse
            }
            Response::DeactivateSynchronousStepping { .. } => {
                MessageId::DeactivateSynchronousSteppingResponse
            }
            Response::AdvanceSynchronousStepping { .. } => {
                MessageId::AdvanceSynchronousSteppingResponse
            }
            Response::ResetSimulation { .. } => MessageId::ResetSimulationResponse,
            Response::SetSunSimulation { .. } => MessageId::SetSunSimulationResponse,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Response::RegisterClient(resp) => bincode::serialize(resp)?,
            Response::UnregisterClient => Vec::new(),
            Response::RegisterCaptureCamera { camera_id } => bincode::serialize(camera_id)?,
            Response::AdvanceSynchronousStepping { sequence_number } => {
                bincode::serialize(sequence_number)?
            }
            Response::RequestAgentControl { control_granted: flag }
            | Response::ReleaseAgentControl {
                control_released: flag,
            }
            | Response::ResetAgent { success: flag }
            | Response::ActivateSynchronousStepping { result: flag }
            | Response::DeactivateSynchronousStepping { result: flag }
            | Response::ResetSimulation { success: flag }
            | Response::SetSunSimulation { success: flag } => bincode::serialize(flag)?,
        };
        Ok(bytes)
    }

    pub fn decode(id: MessageId, payload: &[u8]) -> Result<Response, ProtocolError> {
        let response = match id {
            MessageId::RegisterClientResponse => Response::RegisterClient(decode_payload(payload)?),
            MessageId::UnregisterClientResponse => Response::UnregisterClient,
            MessageId::RegisterCaptureCameraResponse => Response::RegisterCaptureCamera {
                camera_id: decode_payload(payload)?,
            },
            MessageId::RequestAgentControlResponse => Response::RequestAgentControl {
                control_granted: decode_payload(payload)?,
            },
            MessageId::ReleaseAgentControlResponse => Response::ReleaseAgentControl {
                control_released: decode_payload(payload)?,
            },
            MessageId::ResetAgentResponse => Response::ResetAgent {
                success: decode_payload(payload)?,
            },
            MessageId::ActivateSynchronousSteppingResponse => {
                Response::ActivateSynchronousStepping {
                    result: decode_payload(payload)?,
                }
            }
            MessageId::DeactivateSynchronousSteppingResponse => {
                Response::DeactivateSynchronousStepping {
                    result: decode_payload(payload)?,
                }
            }
            MessageId::AdvanceSynchronousSteppingResponse => Response::AdvanceSynchronousStepping {
                sequence_number: decode_payload(payload)?,
            },
            MessageId::ResetSimulationResponse => Response::ResetSimulation {
                success: decode_payload(payload)?,
            },
            MessageId::SetSunSimulationResponse => Response::SetSunSimulation {
                success: decode_payload(payload)?,
            },
            other => return Err(ProtocolError::WrongDirection(other.as_u32(), "response")),
        };
        Ok(response)
    }
}

/// Decode a single payload struct. Truncated or malformed input yields
/// `ProtocolError::Codec` rather than a panic.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(payload)?)
}
