// Contracts between the control server and the simulation it drives.
//
// The server never renders, ticks physics, or encodes pixels; it sequences
// those through three traits implemented by the host engine:
//
// - `SimulationProxy`: configure the simulation, learn about client
//   sessions, register capture cameras, and drive the controlled agent.
// - `SimulationWorld`: the world handle that can be paused and unpaused.
//   Synchronous stepping is only available while one is attached.
// - `CapturePipeline`: accepts a one-shot "next capture finished" handle.
//
// Asynchronous completions (`CaptureCompletion`, `AgentResetCompletion`)
// are one-shot handles consumed by `complete(..)`. They post a `ServerSignal`
// back to the server, which applies it on its next update tick, so the
// update context stays the only writer of the stepping state no matter which
// thread the engine completes from.
//
// All proxy methods except `reset_agent` are synchronous. Implementations
// must be `Send + Sync`: client registration calls the proxy from connection
// threads, everything else from the update tick.

use std::sync::mpsc::Sender;

use drivelink_protocol::{
    CameraId, CaptureSequence, ClientId, ControlValues, RegisterCaptureCameraRequest,
    SimulationConfiguration, SimulationGraphicsSettings, SunSimulationSettings,
};
use log::debug;

/// Operations the server performs on the simulation.
pub trait SimulationProxy: Send + Sync {
    /// Apply a simulation configuration. `is_initial` is true when the first
    /// master registers and false for `ResetSimulation`.
    fn configure_simulation(
        &self,
        configuration: &SimulationConfiguration,
        graphics: &SimulationGraphicsSettings,
        is_initial: bool,
    );

    fn register_client(&self, client_id: ClientId, is_master: bool);

    fn unregister_client(&self, client_id: ClientId, was_master: bool);

    /// Returns the new camera's id, or 0 if the simulation refused it.
    fn register_capture_camera(&self, camera: &RegisterCaptureCameraRequest) -> CameraId;

    fn request_agent_control(&self) -> bool;

    fn release_agent_control(&self);

    fn set_agent_control_values(&self, controls: &ControlValues);

    /// Start resetting the agent. The simulation reports the outcome later
    /// through `completion`.
    fn reset_agent(&self, completion: AgentResetCompletion);

    fn set_sun_simulation(&self, settings: &SunSimulationSettings);
}

/// The pausable simulation world.
pub trait SimulationWorld: Send + Sync {
    fn set_paused(&self, paused: bool);
}

/// The asynchronous capture pipeline.
pub trait CapturePipeline: Send + Sync {
    /// Complete `completion` when the next capture finishes.
    fn on_next_capture(&self, completion: CaptureCompletion);
}

/// Signals posted back to the server by completion handles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ServerSignal {
    CaptureFinished(CaptureSequence),
    AgentReset(bool),
}

/// One-shot notification that a capture finished.
#[derive(Debug)]
pub struct CaptureCompletion {
    signals: Sender<ServerSignal>,
}

impl CaptureCompletion {
    pub(crate) fn new(signals: Sender<ServerSignal>) -> Self {
        Self { signals }
    }

    /// Report the sequence number of the finished capture.
    pub fn complete(self, sequence: CaptureSequence) {
        if self
            .signals
            .send(ServerSignal::CaptureFinished(sequence))
            .is_err()
        {
            debug!("capture {sequence} finished after the server shut down");
        }
    }
}

/// One-shot notification that an agent reset finished.
#[derive(Debug)]
pub struct AgentResetCompletion {
    signals: Sender<ServerSignal>,
}

impl AgentResetCompletion {
    pub(crate) fn new(signals: Sender<ServerSignal>) -> Self {
        Self { signals }
    }

    pub fn complete(self, success: bool) {
        if self.signals.send(ServerSignal::AgentReset(success)).is_err() {
            debug!("agent reset finished after the server shut down");
        }
    }
}
