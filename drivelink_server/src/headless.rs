// Headless simulation host.
//
// `HeadlessSimulation` stands in for a rendering engine: it implements
// `SimulationProxy`, `SimulationWorld` and `CapturePipeline` against a small
// in-memory model (sim clock, agent controls, camera list, sun settings) and
// records every proxy call so tests can assert on them. Each `tick()` is one
// rendered frame: the clock advances unless paused, pending agent resets
// complete successfully, and pending capture handles complete with the
// frame's sequence number.
//
// `start_headless_server` wires one of these to a `ControlServer` and a
// `ConnectionListener` and drives both from a background frame loop. The
// `drivelink-server` binary is a thin wrapper around it.
//
// See also: `server.rs` for what the server does on each `update()`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use drivelink_protocol::{
    CameraId, CaptureSequence, ClientId, ControlValues, RegisterCaptureCameraRequest,
    SimulationConfiguration, SimulationGraphicsSettings, SunSimulationSettings,
};
use log::{debug, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::ConnectionListener;
use crate::proxy::{
    AgentResetCompletion, CaptureCompletion, CapturePipeline, SimulationProxy, SimulationWorld,
};
use crate::server::ControlServer;

/// A proxy call as recorded by `HeadlessSimulation`.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyCall {
    ConfigureSimulation { is_initial: bool, seed: u32 },
    RegisterClient { client_id: ClientId, is_master: bool },
    UnregisterClient { client_id: ClientId, was_master: bool },
    RegisterCaptureCamera { label: String },
    RequestAgentControl,
    ReleaseAgentControl,
    SetAgentControlValues(ControlValues),
    ResetAgent,
    SetSunSimulation(SunSimulationSettings),
}

#[derive(Default)]
struct HeadlessState {
    calls: Vec<ProxyCall>,
    paused: bool,
    agent_controlled: bool,
    controls: ControlValues,
    configuration: SimulationConfiguration,
    graphics: SimulationGraphicsSettings,
    sun: SunSimulationSettings,
    cameras: Vec<String>,
    sim_time: f64,
    frame: u64,
    next_sequence: CaptureSequence,
    pending_captures: Vec<CaptureCompletion>,
    pending_resets: Vec<AgentResetCompletion>,
}

pub struct HeadlessSimulation {
    max_cameras: u32,
    state: Mutex<HeadlessState>,
}

impl HeadlessSimulation {
    pub fn new(max_cameras: u32) -> Self {
        Self {
            max_cameras,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    /// Render one frame of `delta_seconds` host time.
    pub fn tick(&self, delta_seconds: f32) {
        let (captures, resets, sequence) = {
            let mut state = self.lock();
            if !state.paused && delta_seconds.is_finite() && delta_seconds > 0.0 {
                let dilation = match state.configuration.time_dilation {
                    d if d > 0.0 => f64::from(d),
                    _ => 1.0,
                };
                state.sim_time += f64::from(delta_seconds) * dilation;
            }
            state.frame += 1;
            let sequence = state.next_sequence;
            state.next_sequence = sequence.checked_add(1).unwrap_or(0);

            let resets = std::mem::take(&mut state.pending_resets);
            if !resets.is_empty() {
                state.controls = ControlValues::default();
            }
            (std::mem::take(&mut state.pending_captures), resets, sequence)
        };

        for capture in captures {
            capture.complete(sequence);
        }
        for reset in resets {
            reset.complete(true);
        }
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.lock().calls.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_agent_controlled(&self) -> bool {
        self.lock().agent_controlled
    }

    pub fn control_values(&self) -> ControlValues {
        self.lock().controls
    }

    pub fn configuration(&self) -> SimulationConfiguration {
        self.lock().configuration.clone()
    }

    pub fn graphics_settings(&self) -> SimulationGraphicsSettings {
        self.lock().graphics.clone()
    }

    pub fn sun_settings(&self) -> SunSimulationSettings {
        self.lock().sun
    }

    pub fn camera_labels(&self) -> Vec<String> {
        self.lock().cameras.clone()
    }

    /// Simulated seconds elapsed while unpaused.
    pub fn sim_time(&self) -> f64 {
        self.lock().sim_time
    }

    pub fn frame(&self) -> u64 {
        self.lock().frame
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SimulationProxy for HeadlessSimulation {
    fn configure_simulation(
        &self,
        configuration: &SimulationConfiguration,
        graphics: &SimulationGraphicsSettings,
        is_initial: bool,
    ) {
        let mut state = self.lock();
        state.calls.push(ProxyCall::ConfigureSimulation {
            is_initial,
            seed: configuration.seed,
        });
        state.configuration = configuration.clone();
        state.graphics = graphics.clone();
        if !is_initial {
            state.sim_time = 0.0;
            state.controls = ControlValues::default();
        }
    }

    fn register_client(&self, client_id: ClientId, is_master: bool) {
        self.lock().calls.push(ProxyCall::RegisterClient {
            client_id,
            is_master,
        });
    }

    fn unregister_client(&self, client_id: ClientId, was_master: bool) {
        let mut state = self.lock();
        state.calls.push(ProxyCall::UnregisterClient {
            client_id,
            was_master,
        });
        if was_master {
            state.agent_controlled = false;
        }
    }

    fn register_capture_camera(&self, camera: &RegisterCaptureCameraRequest) -> CameraId {
        let mut state = self.lock();
        state.calls.push(ProxyCall::RegisterCaptureCamera {
            label: camera.camera_label.clone(),
        });
        if state.cameras.len() >= self.max_cameras as usize {
            debug!("camera {:?} refused: limit reached", camera.camera_label);
            return 0;
        }
        state.cameras.push(camera.camera_label.clone());
        CameraId::try_from(state.cameras.len()).unwrap_or(0)
    }

    fn request_agent_control(&self) -> bool {
        let mut state = self.lock();
        state.calls.push(ProxyCall::RequestAgentControl);
        state.agent_controlled = true;
        true
    }

    fn release_agent_control(&self) {
        let mut state = self.lock();
        state.calls.push(ProxyCall::ReleaseAgentControl);
        state.agent_controlled = false;
    }

    fn set_agent_control_values(&self, controls: &ControlValues) {
        let mut state = self.lock();
        state.calls.push(ProxyCall::SetAgentControlValues(*controls));
        state.controls = *controls;
    }

    fn reset_agent(&self, completion: AgentResetCompletion) {
        let mut state = self.lock();
        state.calls.push(ProxyCall::ResetAgent);
        state.pending_resets.push(completion);
    }

    fn set_sun_simulation(&self, settings: &SunSimulationSettings) {
        let mut state = self.lock();
        state.calls.push(ProxyCall::SetSunSimulation(*settings));
        state.sun = *settings;
    }
}

impl SimulationWorld for HeadlessSimulation {
    fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }
}

impl CapturePipeline for HeadlessSimulation {
    fn on_next_capture(&self, completion: CaptureCompletion) {
        self.lock().pending_captures.push(completion);
    }
}

// ---------------------------------------------------------------------------
// Background runner
// ---------------------------------------------------------------------------

/// Handle returned by `start_headless_server`.
pub struct HeadlessHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    simulation: Arc<HeadlessSimulation>,
}

impl HeadlessHandle {
    pub fn simulation(&self) -> &Arc<HeadlessSimulation> {
        &self.simulation
    }

    /// Signal the frame loop to stop and wait for the server to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.join();
    }

    /// Block until the frame loop exits.
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Start a headless simulation and control server on a background thread.
/// Returns the handle and the bound client address (useful when
/// `client_port` is 0).
pub fn start_headless_server(
    config: ServerConfig,
) -> Result<(HeadlessHandle, SocketAddr), ServerError> {
    let simulation = Arc::new(HeadlessSimulation::new(config.max_supported_cameras));
    let mut server = ControlServer::new(config.clone(), simulation.clone());
    let endpoints = server.register_proxy(
        simulation.clone(),
        &config.sim_host,
        config.sim_port,
        &config.client_host,
        config.client_port,
    )?;
    server.set_world(Some(simulation.clone()));

    let listener = ConnectionListener::bind(endpoints.client, server.handle())?;
    let addr = listener.local_addr();
    server.attach_listener(listener);

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_loop = Arc::clone(&keep_running);
    let simulation_loop = Arc::clone(&simulation);
    let frame = config.frame_duration();
    let thread = thread::Builder::new()
        .name("drivelink-frames".into())
        .spawn(move || run_frames(server, simulation_loop, frame, keep_running_loop))?;

    Ok((
        HeadlessHandle {
            keep_running,
            thread: Some(thread),
            simulation,
        },
        addr,
    ))
}

/// Frame loop. Runs until `keep_running` is set to false.
fn run_frames(
    mut server: ControlServer,
    simulation: Arc<HeadlessSimulation>,
    frame: Duration,
    keep_running: Arc<AtomicBool>,
) {
    info!("headless frame loop running at {frame:?} per frame");
    let mut last = Instant::now();
    while keep_running.load(Ordering::SeqCst) {
        thread::sleep(frame);
        let now = Instant::now();
        let delta = now.duration_since(last).as_secs_f32();
        last = now;

        simulation.tick(delta);
        server.update(delta);
    }
    server.shutdown();
    info!("headless frame loop stopped");
}
