// Accept loop for the client endpoint.
//
// A non-blocking `TcpListener` polled every 50 ms so `terminate()` can stop
// it promptly. Accepted sockets are switched back to blocking mode and
// handed to `ServerHandle::add_incoming_connection`; the server turns them
// into connections on its next tick.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::server::ServerHandle;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ConnectionListener {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ConnectionListener {
    /// Bind `addr` and start accepting on a background thread.
    pub fn bind(addr: impl ToSocketAddrs, server: ServerHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let keep_running_thread = Arc::clone(&keep_running);
        let thread = thread::Builder::new()
            .name("drivelink-listener".into())
            .spawn(move || accept_loop(listener, server, keep_running_thread))?;

        info!("listening for clients on {local_addr}");
        Ok(Self {
            keep_running,
            thread: Some(thread),
            local_addr,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept thread to exit.
    pub fn terminate(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            debug!("listener on {} terminated", self.local_addr);
        }
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn accept_loop(listener: TcpListener, server: ServerHandle, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, remote_addr)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("dropping connection from {remote_addr}: {e}");
                    continue;
                }
                debug!("accepted connection from {remote_addr}");
                server.add_incoming_connection(stream, remote_addr);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}
