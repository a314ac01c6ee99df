// Blocking TCP client for the control server.
//
// Architecture:
// - `connect()` performs the TCP connect and the `RegisterClient` handshake
//   on the calling thread, then spawns a background reader thread.
// - The reader thread calls `read_frame()` in a loop, decodes `Response`s
//   and pushes them into an `mpsc` channel.
// - The caller holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox without blocking; `wait_for()` blocks until a
//   matching response shows up or a timeout passes.
//
// The server only materializes a connection on its next update tick, so the
// handshake waits for up to `HANDSHAKE_TIMEOUT`.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use drivelink_protocol::{
    AdvanceSynchronousSteppingRequest, ClientId, ControlValues, Frame, MessageId,
    RegisterClientRequest, RegisterClientResponse, Request, Response, SetAgentControlValuesRequest,
    read_frame, write_frame,
};
use log::{debug, warn};

use crate::error::ClientError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP client for one control-server session.
pub struct NetClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<Response>,
    _reader_thread: Option<JoinHandle<()>>,
    registration: RegisterClientResponse,
}

impl NetClient {
    /// Connect, register, and spawn the reader thread.
    pub fn connect(
        addr: impl ToSocketAddrs,
        request: RegisterClientRequest,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        let hello = Frame::request(ClientId::NONE, &Request::RegisterClient(request))?;
        write_frame(&mut writer, &hello)?;

        let registration = match read_frame(&mut reader)?.decode_response()? {
            Response::RegisterClient(registration) => registration,
            other => return Err(ClientError::UnexpectedResponse(other)),
        };
        if registration.client_id.is_none() {
            return Err(ClientError::Refused);
        }

        reader.get_ref().set_read_timeout(None)?;
        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name(format!("drivelink-client-{}", registration.client_id))
            .spawn(move || reader_loop(reader, tx))?;

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
            registration,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.registration.client_id
    }

    pub fn is_master(&self) -> bool {
        self.registration.granted_master_role
    }

    /// The server's answer to the handshake.
    pub fn registration(&self) -> &RegisterClientResponse {
        &self.registration
    }

    pub fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let frame = Frame::request(self.registration.client_id, request)?;
        write_frame(&mut self.writer, &frame)?;
        Ok(())
    }

    pub fn set_control_values(&mut self, controls: ControlValues) -> Result<(), ClientError> {
        self.send(&Request::SetAgentControlValues(
            SetAgentControlValuesRequest { controls },
        ))
    }

    pub fn advance(&mut self, time_step: f32, controls: ControlValues) -> Result<(), ClientError> {
        self.send(&Request::AdvanceSynchronousStepping(
            AdvanceSynchronousSteppingRequest {
                time_step,
                controls,
            },
        ))
    }

    /// Drain all queued responses (non-blocking).
    pub fn poll(&self) -> Vec<Response> {
        let mut responses = Vec::new();
        while let Ok(response) = self.inbox.try_recv() {
            responses.push(response);
        }
        responses
    }

    /// Block until a response with id `id` arrives. Responses of other kinds
    /// received meanwhile are discarded.
    pub fn wait_for(&self, id: MessageId, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok(response) if response.message_id() == id => return Some(response),
                Ok(other) => debug!("skipping {:?} while waiting for {id:?}", other.message_id()),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Send `UnregisterClient` and close the write side.
    pub fn disconnect(&mut self) {
        if let Err(e) = self.send(&Request::UnregisterClient) {
            debug!("unregister failed: {e}");
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Write);
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        // Unblocks the reader thread, which holds its own handle to the socket.
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Reader thread: read frames in a loop, push decoded responses.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<Response>) {
    while let Ok(frame) = read_frame(&mut reader) {
        match frame.decode_response() {
            Ok(response) => {
                if tx.send(response).is_err() {
                    break;
                }
            }
            Err(e) => warn!("undecodable frame {} from server: {e}", frame.message_id),
        }
    }
}
