// Shared fixtures for the unit tests in this crate.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use drivelink_protocol::{
    ClientId, Frame, PROTOCOL_VERSION, ProtocolError, RegisterClientRequest, Request, Response,
    SimulationConfiguration, SimulationGraphicsSettings, read_frame, write_frame,
};

use crate::config::ServerConfig;
use crate::headless::HeadlessSimulation;
use crate::server::ControlServer;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected localhost pair: (client side, server side, server side's view
/// of the client address).
pub fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, addr) = listener.accept().unwrap();
    (client, server, addr)
}

/// A server with a registered headless simulation as proxy, world and
/// capture pipeline. Nothing ticks on its own.
pub fn headless_server() -> (ControlServer, Arc<HeadlessSimulation>) {
    headless_server_with(ServerConfig::default())
}

pub fn headless_server_with(config: ServerConfig) -> (ControlServer, Arc<HeadlessSimulation>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = Arc::new(HeadlessSimulation::new(config.max_supported_cameras));
    let mut server = ControlServer::new(config, sim.clone());
    server
        .register_proxy(sim.clone(), "127.0.0.1", 9009, "127.0.0.1", 9876)
        .unwrap();
    server.set_world(Some(sim.clone()));
    (server, sim)
}

pub fn register_request(wants_master: bool) -> Request {
    Request::RegisterClient(RegisterClientRequest {
        client_protocol_version: PROTOCOL_VERSION,
        request_master_role: wants_master,
        configuration: SimulationConfiguration::default(),
        graphics_settings: SimulationGraphicsSettings::default(),
    })
}

/// The client end of a test socket, speaking raw frames.
pub struct TestPeer {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TestPeer {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            reader,
            writer: BufWriter::new(stream),
        }
    }

    pub fn send(&mut self, request: &Request) {
        let frame = Frame::request(ClientId::NONE, request).unwrap();
        write_frame(&mut self.writer, &frame).unwrap();
    }

    /// Block until the next response arrives.
    pub fn recv(&mut self) -> Response {
        read_frame(&mut self.reader)
            .unwrap()
            .decode_response()
            .unwrap()
    }

    /// True if no frame arrives within `wait`.
    pub fn is_silent(&mut self, wait: Duration) -> bool {
        self.with_timeout(wait, |reader| read_frame(reader).is_err())
    }

    /// True if the server closes the socket within `wait`. Frames still in
    /// flight are skipped.
    pub fn is_closed(&mut self, wait: Duration) -> bool {
        self.with_timeout(wait, |reader| loop {
            match read_frame(reader) {
                Ok(_) => continue,
                Err(ProtocolError::Io(e)) => {
                    return !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut);
                }
                Err(_) => return true,
            }
        })
    }

    fn with_timeout<T>(
        &mut self,
        wait: Duration,
        f: impl FnOnce(&mut BufReader<TcpStream>) -> T,
    ) -> T {
        self.reader.get_ref().set_read_timeout(Some(wait)).unwrap();
        let result = f(&mut self.reader);
        let _ = self.reader.get_ref().set_read_timeout(Some(READ_TIMEOUT));
        result
    }
}
