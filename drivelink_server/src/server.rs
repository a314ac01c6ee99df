// The control server: session registry, inbound queue, stepping machine and
// request handlers.
//
// Architecture: connection threads feed a single update context.
//
// - **Listener thread** (`listener.rs`): accepts sockets and hands them to
//   `ServerHandle::add_incoming_connection`, which only queues them.
// - **Connection threads** (`connection.rs`): one reader and one writer per
//   socket. Readers handle `RegisterClient`/`UnregisterClient` directly
//   through `ServerHandle` and queue every other frame as an
//   `InboundMessage`.
// - **Update context**: whoever owns the `ControlServer` calls `update()`
//   once per host frame. Each tick applies completion signals, materializes
//   at most one queued socket into a `ClientConnection`, then either
//   dispatches at most one inbound message (Continuous/Idle) or watches the
//   advance deadline (Advance). Nothing is dispatched while a step is in
//   flight; messages simply wait in the queue.
//
// `ServerHandle` is the cloneable, thread-safe half (registry mutex, proxy
// slot, queue senders). `ControlServer` is the update-context half and owns
// the receivers, the stepping machine and the world/capture handles, so the
// stepping state needs no lock at all.
//
// Handlers never fail the server: malformed payloads, unknown ids and
// messages from sessions that are already gone are logged and dropped.
// Authority failures get an explicit negative answer (false, camera 0,
// sequence -1) without touching the proxy.

use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;

use drivelink_protocol::{
    AdvanceSynchronousSteppingRequest, CaptureSequence, ClientId, PROTOCOL_VERSION, ProtocolError,
    RegisterCaptureCameraRequest, RegisterClientResponse, Request, ResetSimulationRequest,
    Response, SetAgentControlValuesRequest, SetSunSimulationRequest, SimulationConfiguration,
    SimulationGraphicsSettings, decode_payload,
};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;

use crate::address::ServerEndpoints;
use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::dispatch::{DispatchTable, Handler};
use crate::error::ServerError;
use crate::listener::ConnectionListener;
use crate::proxy::{
    AgentResetCompletion, CaptureCompletion, CapturePipeline, ServerSignal, SimulationProxy,
    SimulationWorld,
};
use crate::registry::{Registration, SessionRegistry};
use crate::stepping::{SteppingMachine, SteppingState, step_duration};

/// A queued request, tagged with the server-assigned id of its sender.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub client_id: ClientId,
    pub message_id: u32,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn from_request(client_id: ClientId, request: &Request) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id,
            message_id: request.message_id().as_u32(),
            payload: request.encode_payload()?,
        })
    }
}

/// An accepted socket waiting for the next tick.
struct IncomingConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
}

struct Shared {
    registry: Mutex<SessionRegistry<Arc<ClientConnection>>>,
    proxy: RwLock<Option<Arc<dyn SimulationProxy>>>,
    inbound: Sender<InboundMessage>,
    incoming: Sender<IncomingConnection>,
    max_supported_cameras: u32,
    max_capture_resolution: u32,
    inactivity_timeout_ms: u32,
}

/// Thread-safe handle to a running `ControlServer`.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Queue an accepted socket. It becomes a connection on the next tick.
    pub fn add_incoming_connection(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let incoming = IncomingConnection {
            stream,
            remote_addr,
        };
        if self.shared.incoming.send(incoming).is_err() {
            debug!("server gone, dropping connection from {remote_addr}");
        }
    }

    /// Queue a request for the update tick.
    pub fn enqueue_message(&self, message: InboundMessage) {
        if self.shared.inbound.send(message).is_err() {
            debug!("server gone, dropping inbound message");
        }
    }

    /// Register `connection` as a new session.
    ///
    /// Holds the registry lock across the master decision and the proxy
    /// notifications, so concurrent registrations are fully serialized. The
    /// first master also configures the simulation with `is_initial = true`.
    /// Returns `None` (and creates no session) while no proxy is registered.
    pub fn register_client(
        &self,
        connection: &Arc<ClientConnection>,
        wants_master: bool,
        configuration: &SimulationConfiguration,
        graphics: &SimulationGraphicsSettings,
    ) -> Option<Registration> {
        let mut registry = self.lock_registry();
        let Some(proxy) = self.proxy() else {
            warn!(
                "registration from {} refused: no simulation proxy",
                connection.remote_addr()
            );
            return None;
        };

        let registration = registry.register(Arc::clone(connection), wants_master);
        connection.set_identity(registration);
        if registration.granted_master {
            proxy.configure_simulation(configuration, graphics, true);
        }
        proxy.register_client(registration.client_id, registration.granted_master);

        info!(
            "client {} registered from {} (master: {})",
            registration.client_id,
            connection.remote_addr(),
            registration.granted_master
        );
        Some(registration)
    }

    /// Remove a session, notify the proxy and stop its connection.
    pub fn unregister_client(&self, client_id: ClientId) {
        let session = {
            let mut registry = self.lock_registry();
            let Some(was_master) = registry.get(client_id).map(|s| s.is_master) else {
                info!("unregister: no session for client {client_id}");
                return;
            };
            if let Some(proxy) = self.proxy() {
                proxy.unregister_client(client_id, was_master);
            }
            registry.unregister(client_id)
        };
        if let Some(session) = session {
            info!(
                "client {client_id} unregistered (was master: {})",
                session.is_master
            );
            session.connection.stop();
        }
    }

    pub fn connection(&self, client_id: ClientId) -> Option<Arc<ClientConnection>> {
        self.lock_registry()
            .get(client_id)
            .map(|s| Arc::clone(&s.connection))
    }

    pub fn master_client_id(&self) -> Option<ClientId> {
        self.lock_registry().master_client_id()
    }

    pub fn client_count(&self) -> usize {
        self.lock_registry().len()
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy().is_some()
    }

    pub(crate) fn registration_response(
        &self,
        registration: Registration,
    ) -> RegisterClientResponse {
        RegisterClientResponse {
            client_id: registration.client_id,
            granted_master_role: registration.granted_master,
            server_protocol_version: PROTOCOL_VERSION,
            max_supported_cameras: self.shared.max_supported_cameras,
            max_capture_resolution: self.shared.max_capture_resolution,
            inactivity_timeout_ms: self.shared.inactivity_timeout_ms,
        }
    }

    fn proxy(&self) -> Option<Arc<dyn SimulationProxy>> {
        self.shared
            .proxy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_proxy(&self, proxy: Option<Arc<dyn SimulationProxy>>) {
        *self
            .shared
            .proxy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = proxy;
    }

    fn lock_registry(&self) -> MutexGuard<'_, SessionRegistry<Arc<ClientConnection>>> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-message context handed to each handler.
struct RequestContext<'a> {
    proxy: Arc<dyn SimulationProxy>,
    client: Arc<ClientConnection>,
    payload: &'a [u8],
    now: Instant,
}

/// The update-context half of the server.
pub struct ControlServer {
    handle: ServerHandle,
    config: ServerConfig,
    inbound: Receiver<InboundMessage>,
    incoming: Receiver<IncomingConnection>,
    signals: Receiver<ServerSignal>,
    signal_tx: Sender<ServerSignal>,
    stepping: SteppingMachine,
    dispatch: DispatchTable,
    capture: Arc<dyn CapturePipeline>,
    world: Option<Arc<dyn SimulationWorld>>,
    endpoints: Option<ServerEndpoints>,
    listener: Option<ConnectionListener>,
    connections: Vec<Weak<ClientConnection>>,
}

impl ControlServer {
    pub fn new(config: ServerConfig, capture: Arc<dyn CapturePipeline>) -> Self {
        let (inbound_tx, inbound) = mpsc::channel();
        let (incoming_tx, incoming) = mpsc::channel();
        let (signal_tx, signals) = mpsc::channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(SessionRegistry::new()),
            proxy: RwLock::new(None),
            inbound: inbound_tx,
            incoming: incoming_tx,
            max_supported_cameras: config.max_supported_cameras,
            max_capture_resolution: config.max_capture_resolution,
            inactivity_timeout_ms: config.inactivity_timeout_ms,
        });
        Self {
            handle: ServerHandle { shared },
            config,
            inbound,
            incoming,
            signals,
            signal_tx,
            stepping: SteppingMachine::new(),
            dispatch: DispatchTable::standard(),
            capture,
            world: None,
            endpoints: None,
            listener: None,
            connections: Vec::new(),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Attach the simulation proxy and validate both endpoints.
    ///
    /// On an invalid address nothing changes. On success any queued
    /// messages from before are discarded and stepping starts over in
    /// `Continuous`.
    pub fn register_proxy(
        &mut self,
        proxy: Arc<dyn SimulationProxy>,
        sim_host: &str,
        sim_port: u16,
        client_host: &str,
        client_port: u16,
    ) -> Result<ServerEndpoints, ServerError> {
        let endpoints = ServerEndpoints::parse(sim_host, sim_port, client_host, client_port)?;

        let mut discarded = 0usize;
        while self.inbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("discarded {discarded} stale queued messages");
        }
        self.stepping.reset();
        self.handle.set_proxy(Some(proxy));
        self.endpoints = Some(endpoints);

        info!(
            "simulation proxy registered (simulation {}, clients {})",
            endpoints.simulation, endpoints.client
        );
        Ok(endpoints)
    }

    /// Detach the proxy: stop the listener, stop every connection, clear
    /// the registry and the master slot.
    pub fn unregister_proxy(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.terminate();
        }

        let sessions = self.handle.lock_registry().drain();
        for session in &sessions {
            session.connection.stop();
        }
        for connection in self.connections.drain(..) {
            if let Some(connection) = connection.upgrade() {
                connection.stop();
            }
        }
        while self.incoming.try_recv().is_ok() {}

        if self.handle.has_proxy() || !sessions.is_empty() {
            info!(
                "simulation proxy unregistered, {} sessions closed",
                sessions.len()
            );
        }
        self.handle.set_proxy(None);
        self.endpoints = None;
    }

    /// Unregister the proxy and release everything the server owns.
    pub fn shutdown(mut self) {
        self.unregister_proxy();
    }

    pub fn endpoints(&self) -> Option<ServerEndpoints> {
        self.endpoints
    }

    pub fn set_world(&mut self, world: Option<Arc<dyn SimulationWorld>>) {
        self.world = world;
    }

    /// Hand over a listener so it is terminated with the proxy.
    pub fn attach_listener(&mut self, listener: ConnectionListener) {
        if let Some(previous) = self.listener.replace(listener) {
            previous.terminate();
        }
    }

    pub fn add_incoming_connection(&self, stream: TcpStream, remote_addr: SocketAddr) {
        self.handle.add_incoming_connection(stream, remote_addr);
    }

    pub fn stepping_state(&self) -> SteppingState {
        self.stepping.state()
    }

    pub fn stepping_client(&self) -> Option<ClientId> {
        self.stepping.stepping_client()
    }

    pub fn master_client_id(&self) -> Option<ClientId> {
        self.handle.master_client_id()
    }

    /// One host frame. Advance deadlines run on the monotonic clock, so the
    /// host's frame delta is not needed.
    pub fn update(&mut self, _delta_seconds: f32) {
        self.update_at(Instant::now());
    }

    /// One host frame at an explicit instant.
    pub fn update_at(&mut self, now: Instant) {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                ServerSignal::CaptureFinished(sequence) => self.on_capture_finished(sequence),
                ServerSignal::AgentReset(success) => self.on_agent_reset(success),
            }
        }

        self.materialize_next_connection();

        if !self.stepping.state().accepts_messages() {
            self.poll_advance(now);
        } else if let Ok(message) = self.inbound.try_recv() {
            self.handle_message(message, now);
        }
    }

    /// The capture registered at the end of an advance finished.
    pub fn on_capture_finished(&mut self, sequence: CaptureSequence) {
        match self.stepping.capture_finished() {
            Ok(Some(client_id)) => match self.handle.connection(client_id) {
                Some(client) => {
                    debug!("step for client {client_id} finished with capture {sequence}");
                    client.enqueue_response(Response::AdvanceSynchronousStepping {
                        sequence_number: sequence,
                    });
                }
                None => info!(
                    "client {client_id} left before capture {sequence} finished, dropping response"
                ),
            },
            Ok(None) => debug!("capture {sequence} finished with no stepping client"),
            Err(e) => debug!("capture {sequence} ignored: {e}"),
        }
    }

    /// The proxy finished an agent reset.
    pub fn on_agent_reset(&mut self, success: bool) {
        let master = self
            .handle
            .master_client_id()
            .and_then(|id| self.handle.connection(id));
        match master {
            Some(client) => client.enqueue_response(Response::ResetAgent { success }),
            None => info!("agent reset finished (success: {success}) but no master is connected"),
        }
    }

    fn materialize_next_connection(&mut self) {
        let Ok(incoming) = self.incoming.try_recv() else {
            return;
        };
        match ClientConnection::spawn(
            incoming.stream,
            incoming.remote_addr,
            self.handle.clone(),
            self.config.write_timeout(),
        ) {
            Ok(connection) => {
                info!("connection from {} accepted", incoming.remote_addr);
                self.connections.retain(|c| c.strong_count() > 0);
                self.connections.push(Arc::downgrade(&connection));
            }
            Err(e) => warn!(
                "failed to set up connection from {}: {e}",
                incoming.remote_addr
            ),
        }
    }

    fn poll_advance(&mut self, now: Instant) {
        if !self.stepping.poll_deadline(now) {
            return;
        }
        if let Some(world) = &self.world {
            world.set_paused(true);
        }
        self.capture
            .on_next_capture(CaptureCompletion::new(self.signal_tx.clone()));
    }

    fn handle_message(&mut self, message: InboundMessage, now: Instant) {
        let Some(proxy) = self.handle.proxy() else {
            debug!(
                "no simulation proxy, dropping message {} from client {}",
                message.message_id, message.client_id
            );
            return;
        };
        let Some(handler) = self.dispatch.lookup(message.message_id) else {
            warn!(
                "no handler for message id {} from client {}",
                message.message_id, message.client_id
            );
            return;
        };
        let Some(client) = self.handle.connection(message.client_id) else {
            info!(
                "dropping {handler:?} from client {}: no such session",
                message.client_id
            );
            return;
        };

        let ctx = RequestContext {
            proxy,
            client,
            payload: &message.payload,
            now,
        };
        match handler {
            Handler::RegisterCaptureCamera => self.register_capture_camera(ctx),
            Handler::RequestAgentControl => self.request_agent_control(ctx),
            Handler::ReleaseAgentControl => self.release_agent_control(ctx),
            Handler::ResetAgent => self.reset_agent(ctx),
            Handler::SetAgentControlValues => self.set_agent_control_values(ctx),
            Handler::ActivateSynchronousStepping => self.activate_synchronous_stepping(ctx),
            Handler::DeactivateSynchronousStepping => self.deactivate_synchronous_stepping(ctx),
            Handler::AdvanceSynchronousStepping => self.advance_synchronous_stepping(ctx),
            Handler::ResetSimulation => self.reset_simulation(ctx),
            Handler::SetSunSimulation => self.set_sun_simulation(ctx),
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn register_capture_camera(&mut self, ctx: RequestContext<'_>) {
        let Some(request) = decode::<RegisterCaptureCameraRequest>(&ctx) else {
            return;
        };
        let camera_id = if ctx.client.is_master() {
            let camera_id = ctx.proxy.register_capture_camera(&request);
            info!(
                "client {} registered camera {camera_id} ({:?})",
                ctx.client.client_id(),
                request.camera_label
            );
            camera_id
        } else {
            refused(&ctx, "RegisterCaptureCamera");
            0
        };
        ctx.client
            .enqueue_response(Response::RegisterCaptureCamera { camera_id });
    }

    fn request_agent_control(&mut self, ctx: RequestContext<'_>) {
        let control_granted = if ctx.client.is_master() {
            ctx.proxy.request_agent_control()
        } else {
            refused(&ctx, "RequestAgentControl");
            false
        };
        ctx.client
            .enqueue_response(Response::RequestAgentControl { control_granted });
    }

    fn release_agent_control(&mut self, ctx: RequestContext<'_>) {
        let control_released = if ctx.client.is_master() {
            ctx.proxy.release_agent_control();
            true
        } else {
            refused(&ctx, "ReleaseAgentControl");
            !self.config.strict_release_control
        };
        ctx.client
            .enqueue_response(Response::ReleaseAgentControl { control_released });
    }

    fn reset_agent(&mut self, ctx: RequestContext<'_>) {
        if ctx.client.is_master() {
            ctx.proxy
                .reset_agent(AgentResetCompletion::new(self.signal_tx.clone()));
        } else {
            refused(&ctx, "ResetAgent");
            ctx.client
                .enqueue_response(Response::ResetAgent { success: false });
        }
    }

    fn set_agent_control_values(&mut self, ctx: RequestContext<'_>) {
        let Some(request) = decode::<SetAgentControlValuesRequest>(&ctx) else {
            return;
        };
        if ctx.client.is_master() {
            ctx.proxy.set_agent_control_values(&request.controls);
        } else {
            refused(&ctx, "SetAgentControlValues");
        }
    }

    fn activate_synchronous_stepping(&mut self, ctx: RequestContext<'_>) {
        let result = match &self.world {
            Some(world) if ctx.client.is_master() => match self.stepping.activate() {
                Ok(()) => {
                    world.set_paused(true);
                    info!(
                        "client {} activated synchronous stepping",
                        ctx.client.client_id()
                    );
                    true
                }
                Err(e) => {
                    info!("ActivateSynchronousStepping refused: {e}");
                    false
                }
            },
            Some(_) => {
                refused(&ctx, "ActivateSynchronousStepping");
                false
            }
            None => {
                info!("ActivateSynchronousStepping refused: no simulation world");
                false
            }
        };
        ctx.client
            .enqueue_response(Response::ActivateSynchronousStepping { result });
    }

    fn deactivate_synchronous_stepping(&mut self, ctx: RequestContext<'_>) {
        let result = match &self.world {
            Some(world) if ctx.client.is_master() => match self.stepping.deactivate() {
                Ok(()) => {
                    world.set_paused(false);
                    info!(
                        "client {} deactivated synchronous stepping",
                        ctx.client.client_id()
                    );
                    true
                }
                Err(e) => {
                    info!("DeactivateSynchronousStepping refused: {e}");
                    false
                }
            },
            Some(_) => {
                refused(&ctx, "DeactivateSynchronousStepping");
                false
            }
            None => {
                info!("DeactivateSynchronousStepping refused: no simulation world");
                false
            }
        };
        ctx.client
            .enqueue_response(Response::DeactivateSynchronousStepping { result });
    }

    fn advance_synchronous_stepping(&mut self, ctx: RequestContext<'_>) {
        let Some(request) = decode::<AdvanceSynchronousSteppingRequest>(&ctx) else {
            return;
        };
        if !ctx.client.is_master() {
            refused(&ctx, "AdvanceSynchronousStepping");
            ctx.client
                .enqueue_response(Response::AdvanceSynchronousStepping {
                    sequence_number: -1,
                });
            return;
        }

        let client_id = ctx.client.client_id();
        let accepted = step_duration(request.time_step)
            .and_then(|step| self.stepping.advance(client_id, ctx.now, step).map(|()| step));
        match accepted {
            Ok(step) => {
                if let Some(world) = &self.world {
                    world.set_paused(false);
                }
                ctx.proxy.set_agent_control_values(&request.controls);
                debug!("client {client_id} advancing {step:?}");
            }
            Err(e) => {
                info!("AdvanceSynchronousStepping refused: {e}");
                ctx.client
                    .enqueue_response(Response::AdvanceSynchronousStepping {
                        sequence_number: -1,
                    });
            }
        }
    }

    fn reset_simulation(&mut self, ctx: RequestContext<'_>) {
        let Some(request) = decode::<ResetSimulationRequest>(&ctx) else {
            return;
        };
        let success = if ctx.client.is_master() {
            ctx.proxy.configure_simulation(
                &request.configuration,
                &request.graphics_settings,
                false,
            );
            true
        } else {
            refused(&ctx, "ResetSimulation");
            false
        };
        ctx.client
            .enqueue_response(Response::ResetSimulation { success });
    }

    fn set_sun_simulation(&mut self, ctx: RequestContext<'_>) {
        let Some(request) = decode::<SetSunSimulationRequest>(&ctx) else {
            return;
        };
        let success = if ctx.client.is_master() {
            ctx.proxy.set_sun_simulation(&request.settings);
            true
        } else {
            refused(&ctx, "SetSunSimulation");
            false
        };
        ctx.client
            .enqueue_response(Response::SetSunSimulation { success });
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.unregister_proxy();
    }
}

fn decode<T: DeserializeOwned>(ctx: &RequestContext<'_>) -> Option<T> {
    match decode_payload(ctx.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            error!(
                "malformed payload from client {}: {e}",
                ctx.client.client_id()
            );
            None
        }
    }
}

fn refused(ctx: &RequestContext<'_>, request: &str) {
    info!(
        "{request} refused: client {} is not master",
        ctx.client.client_id()
    );
}
