// Core ID types for the control protocol.
//
// `ClientId` is the server-assigned session identifier carried in every frame
// header. Ids are handed out monotonically starting at 1 and are never reused
// within a process; 0 is reserved on the wire for "no client" (frames sent
// before registration completes, or responses with no session behind them).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned client session ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    /// Wire value meaning "no client".
    pub const NONE: ClientId = ClientId(0);

    /// The first id a fresh registry hands out.
    pub const FIRST: ClientId = ClientId(1);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The id following this one.
    pub fn next(self) -> ClientId {
        ClientId(self.0.wrapping_add(1).max(1))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Camera id returned by the simulation for a registered capture camera.
/// 0 means the registration was refused.
pub type CameraId = i32;

/// Capture sequence number reported when a frame finishes. Advance responses
/// carry -1 when the request was rejected.
pub type CaptureSequence = i32;
