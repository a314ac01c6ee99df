// Per-socket client connection.
//
// Architecture: two threads per socket, both owned by the connection.
//
// - **Reader thread**: calls `read_frame()` in a loop. `RegisterClient` and
//   `UnregisterClient` are handled right here, under the registry lock (see
//   `ServerHandle::register_client`). Every other frame, including ones with
//   unknown ids, is pushed to the server's inbound queue tagged with this
//   connection's server-assigned `ClientId` (0 before registration; the id
//   the client writes into the header is not trusted). On EOF or a read
//   error the session is unregistered.
// - **Writer thread**: drains an unbounded `mpsc` queue of responses and
//   writes them to the socket. `enqueue_response` never blocks the caller.
//
// `stop()` is the only cancellation primitive. It queues a stop marker
// behind every response already enqueued, waits for the writer to reach it,
// then shuts the socket down so a blocked read returns. Anything enqueued
// after `stop()` is dropped, so no response reaches the socket once it
// returns. A write timeout bounds how long a stalled client can hold it up.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use drivelink_protocol::{
    ClientId, Frame, MessageId, PROTOCOL_VERSION, ProtocolError, RegisterClientRequest, Response,
    decode_payload, read_frame, write_frame,
};
use log::{debug, info, warn};

use crate::registry::Registration;
use crate::server::{InboundMessage, ServerHandle};

/// Items on the writer thread's queue.
enum Outbound {
    Response {
        client_id: ClientId,
        response: Response,
    },
    Stop,
}

/// One live socket session with a client.
pub struct ClientConnection {
    remote_addr: SocketAddr,
    client_id: AtomicU32,
    is_master: AtomicBool,
    stopped: AtomicBool,
    outbound: Sender<Outbound>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    stream: TcpStream,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("remote_addr", &self.remote_addr)
            .field("client_id", &self.client_id())
            .field("is_master", &self.is_master())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ClientConnection {
    /// Wrap an accepted socket and start its reader and writer threads.
    pub fn spawn(
        stream: TcpStream,
        remote_addr: SocketAddr,
        server: ServerHandle,
        write_timeout: Option<Duration>,
    ) -> std::io::Result<Arc<Self>> {
        stream.set_nodelay(true).ok();
        stream.set_write_timeout(write_timeout)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);

        let (tx, rx) = mpsc::channel();
        let connection = Arc::new(Self {
            remote_addr,
            client_id: AtomicU32::new(ClientId::NONE.0),
            is_master: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            outbound: tx,
            writer_thread: Mutex::new(None),
            stream,
        });

        let writer_thread = thread::Builder::new()
            .name(format!("drivelink-writer-{remote_addr}"))
            .spawn(move || writer_loop(writer, rx, remote_addr))?;
        *connection.lock_writer_thread() = Some(writer_thread);

        let reader_connection = Arc::clone(&connection);
        let spawned = thread::Builder::new()
            .name(format!("drivelink-reader-{remote_addr}"))
            .spawn(move || reader_loop(reader, reader_connection, server));
        if let Err(e) = spawned {
            connection.stop();
            return Err(e);
        }

        Ok(connection)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The server-assigned id, or `ClientId::NONE` before registration.
    pub fn client_id(&self) -> ClientId {
        ClientId(self.client_id.load(Ordering::SeqCst))
    }

    /// Authority flag. Only changes at registration.
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_identity(&self, registration: Registration) {
        self.client_id
            .store(registration.client_id.0, Ordering::SeqCst);
        self.is_master
            .store(registration.granted_master, Ordering::SeqCst);
    }

    /// Queue a response for delivery. Never blocks; dropped after `stop()`.
    pub fn enqueue_response(&self, response: Response) {
        if self.is_stopped() {
            debug!(
                "dropping {:?} for stopped connection {}",
                response.message_id(),
                self.remote_addr
            );
            return;
        }
        let item = Outbound::Response {
            client_id: self.client_id(),
            response,
        };
        if self.outbound.send(item).is_err() {
            debug!("writer for {} already exited", self.remote_addr);
        }
    }

    /// Flush responses queued so far, then close the socket. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Outbound::Stop);
        let writer_thread = self.lock_writer_thread().take();
        if let Some(handle) = writer_thread {
            let _ = handle.join();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("connection {} stopped", self.remote_addr);
    }

    fn lock_writer_thread(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.writer_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one decoded frame on the reader thread.
    fn route_frame(self: &Arc<Self>, frame: Frame, server: &ServerHandle) -> ControlFlow<()> {
        match frame.id() {
            Ok(MessageId::RegisterClientRequest) => {
                match decode_payload::<RegisterClientRequest>(&frame.payload) {
                    Ok(request) => self.register(request, server),
                    Err(e) => warn!(
                        "malformed RegisterClient from {}: {e}",
                        self.remote_addr
                    ),
                }
                ControlFlow::Continue(())
            }
            Ok(MessageId::UnregisterClientRequest) => {
                let client_id = self.client_id();
                if client_id.is_none() {
                    debug!(
                        "UnregisterClient from unregistered connection {}",
                        self.remote_addr
                    );
                    return ControlFlow::Continue(());
                }
                self.enqueue_response(Response::UnregisterClient);
                server.unregister_client(client_id);
                self.stop();
                ControlFlow::Break(())
            }
            _ => {
                server.enqueue_message(InboundMessage {
                    client_id: self.client_id(),
                    message_id: frame.message_id,
                    payload: frame.payload,
                });
                ControlFlow::Continue(())
            }
        }
    }

    fn register(self: &Arc<Self>, request: RegisterClientRequest, server: &ServerHandle) {
        if !self.client_id().is_none() {
            warn!(
                "client {} sent RegisterClient twice, keeping its registration",
                self.client_id()
            );
            let existing = Registration {
                client_id: self.client_id(),
                granted_master: self.is_master(),
            };
            self.enqueue_response(Response::RegisterClient(
                server.registration_response(existing),
            ));
            return;
        }
        if request.client_protocol_version != PROTOCOL_VERSION {
            warn!(
                "client at {} speaks protocol {}, server speaks {PROTOCOL_VERSION}",
                self.remote_addr, request.client_protocol_version
            );
        }

        let registration = server
            .register_client(
                self,
                request.request_master_role,
                &request.configuration,
                &request.graphics_settings,
            )
            .unwrap_or(Registration {
                client_id: ClientId::NONE,
                granted_master: false,
            });
        self.enqueue_response(Response::RegisterClient(
            server.registration_response(registration),
        ));
    }

    /// The socket closed underneath us.
    fn connection_lost(&self, server: &ServerHandle) {
        if self.is_stopped() {
            return;
        }
        let client_id = self.client_id();
        info!("client {client_id} at {} disconnected", self.remote_addr);
        if !client_id.is_none() {
            server.unregister_client(client_id);
        }
        self.stop();
    }
}

/// Reader loop for one connection. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    connection: Arc<ClientConnection>,
    server: ServerHandle,
) {
    loop {
        match read_frame(&mut reader) {
            Ok(frame) => {
                if connection.route_frame(frame, &server).is_break() {
                    return;
                }
            }
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                if !connection.is_stopped() {
                    warn!("read from {} failed: {e}", connection.remote_addr);
                }
                break;
            }
        }
    }
    connection.connection_lost(&server);
}

/// Writer loop for one connection. Exits on `Outbound::Stop` or a write error.
fn writer_loop(
    mut writer: BufWriter<TcpStream>,
    outbound: Receiver<Outbound>,
    remote_addr: SocketAddr,
) {
    for item in outbound {
        let (client_id, response) = match item {
            Outbound::Stop => break,
            Outbound::Response {
                client_id,
                response,
            } => (client_id, response),
        };
        let frame = match Frame::response(client_id, &response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode {:?}: {e}", response.message_id());
                continue;
            }
        };
        if let Err(e) = write_frame(&mut writer, &frame) {
            warn!("write to {remote_addr} failed: {e}");
            break;
        }
    }
}
