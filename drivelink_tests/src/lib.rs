// Test-only driver for end-to-end control-server tests.
//
// Wraps the real `NetClient` (from `drivelink_server::client`) with a
// synchronous, test-friendly API: every request method sends the request and
// blocks until the matching response arrives. The server side is a real
// `start_headless_server` instance, so sockets, connection threads, the
// update tick and the stepping machine all run exactly as in the binary.
//
// The only test-specific code here is the blocking poll loop around
// `NetClient::poll()`.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use drivelink_protocol::{
    CameraId, CaptureSequence, ClientId, ControlValues, MessageId, PROTOCOL_VERSION,
    RegisterCaptureCameraRequest, RegisterClientRequest, Request, Response,
    SimulationConfiguration, SimulationGraphicsSettings,
};
use drivelink_server::NetClient;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Initialise test logging once per process.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A test client wrapping a real `NetClient`.
pub struct TestDriver {
    client: NetClient,
    pending: VecDeque<Response>,
}

impl TestDriver {
    /// Connect and register with a default configuration.
    pub fn connect(addr: SocketAddr, wants_master: bool) -> Self {
        Self::connect_with(addr, wants_master, SimulationConfiguration::default())
    }

    pub fn connect_with(
        addr: SocketAddr,
        wants_master: bool,
        configuration: SimulationConfiguration,
    ) -> Self {
        let request = RegisterClientRequest {
            client_protocol_version: PROTOCOL_VERSION,
            request_master_role: wants_master,
            configuration,
            graphics_settings: SimulationGraphicsSettings::default(),
        };
        let client = NetClient::connect(addr, request).expect("TestDriver::connect failed");
        Self {
            client,
            pending: VecDeque::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client.client_id()
    }

    pub fn is_master(&self) -> bool {
        self.client.is_master()
    }

    pub fn send(&mut self, request: &Request) {
        self.client.send(request).expect("send failed");
    }

    /// Send `request` and block until the response with id `expect` arrives.
    pub fn request(&mut self, request: &Request, expect: MessageId) -> Response {
        self.send(request);
        self.poll_until(expect)
    }

    /// Blocking poll until a response with id `id` is received. Other
    /// responses stay queued for later calls.
    pub fn poll_until(&mut self, id: MessageId) -> Response {
        let start = Instant::now();
        loop {
            self.pending.extend(self.client.poll());
            let found = self.pending.iter().position(|r| r.message_id() == id);
            if let Some(response) = found.and_then(|index| self.pending.remove(index)) {
                return response;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {id:?}"
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Assert that nothing arrives within `wait`.
    pub fn assert_silent(&mut self, wait: Duration) {
        thread::sleep(wait);
        self.pending.extend(self.client.poll());
        assert!(
            self.pending.is_empty(),
            "unexpected responses: {:?}",
            self.pending
        );
    }

    pub fn register_camera(&mut self, label: &str) -> CameraId {
        let request = Request::RegisterCaptureCamera(RegisterCaptureCameraRequest {
            horizontal_field_of_view: 90.0,
            capture_width: 512,
            capture_height: 512,
            relative_position: [0.0, 0.0, 1.5],
            relative_rotation: [0.0; 3],
            camera_label: label.into(),
        });
        match self.request(&request, MessageId::RegisterCaptureCameraResponse) {
            Response::RegisterCaptureCamera { camera_id } => camera_id,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn request_control(&mut self) -> bool {
        match self.request(
            &Request::RequestAgentControl,
            MessageId::RequestAgentControlResponse,
        ) {
            Response::RequestAgentControl { control_granted } => control_granted,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn release_control(&mut self) -> bool {
        match self.request(
            &Request::ReleaseAgentControl,
            MessageId::ReleaseAgentControlResponse,
        ) {
            Response::ReleaseAgentControl { control_released } => control_released,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn reset_agent(&mut self) -> bool {
        match self.request(&Request::ResetAgent, MessageId::ResetAgentResponse) {
            Response::ResetAgent { success } => success,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn set_controls(&mut self, controls: ControlValues) {
        self.client
            .set_control_values(controls)
            .expect("set_control_values failed");
    }

    pub fn activate_stepping(&mut self) -> bool {
        match self.request(
            &Request::ActivateSynchronousStepping,
            MessageId::ActivateSynchronousSteppingResponse,
        ) {
            Response::ActivateSynchronousStepping { result } => result,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn deactivate_stepping(&mut self) -> bool {
        match self.request(
            &Request::DeactivateSynchronousStepping,
            MessageId::DeactivateSynchronousSteppingResponse,
        ) {
            Response::DeactivateSynchronousStepping { result } => result,
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Advance one synchronous step and return the capture sequence number
    /// (-1 if refused).
    pub fn step(&mut self, time_step: f32, controls: ControlValues) -> CaptureSequence {
        self.client
            .advance(time_step, controls)
            .expect("advance failed");
        match self.poll_until(MessageId::AdvanceSynchronousSteppingResponse) {
            Response::AdvanceSynchronousStepping { sequence_number } => sequence_number,
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Send `UnregisterClient` and close the connection.
    pub fn disconnect(mut self) {
        self.client.disconnect();
    }
}

/// Block until `condition` holds, polling every `POLL_INTERVAL`.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}
