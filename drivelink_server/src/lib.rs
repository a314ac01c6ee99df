// drivelink_server — session and stepping control server for a camera-based
// driving simulation.
//
// External clients (training harnesses, test drivers) connect over TCP,
// register, and drive the simulated agent. Exactly one of them may hold the
// master role: it configures the simulation, registers capture cameras,
// controls the agent and can switch the simulation into synchronous
// stepping, where each advance runs for a fixed time step and is answered
// with the sequence number of the capture taken at its end. The server never
// renders or simulates anything itself; it sequences the host engine through
// the traits in `proxy.rs`.
//
// Module overview:
// - `server.rs`:     `ControlServer` (update tick, request handlers) and
//                    `ServerHandle` (thread-safe registration entry points).
// - `registry.rs`:   Session registry and first-master-wins election.
// - `stepping.rs`:   The synchronous-stepping state machine.
// - `dispatch.rs`:   Message-id → handler table.
// - `connection.rs`: Per-socket reader/writer threads.
// - `listener.rs`:   Accept loop for the client endpoint.
// - `proxy.rs`:      Traits the host engine implements, plus one-shot
//                    completion handles for asynchronous results.
// - `address.rs`:    Dotted-quad endpoint validation.
// - `config.rs`:     `ServerConfig`, loaded from JSON.
// - `client.rs`:     Blocking `NetClient` for tools and tests.
// - `headless.rs`:   In-memory simulation host and `start_headless_server`.
// - `error.rs`:      Error types.
//
// Dependencies: `drivelink_protocol` (wire types and framing), `log` for
// diagnostics, `serde_json` for configuration. No async runtime.
//
// The server can run as a standalone binary (`main.rs`, driving a headless
// simulation) or be embedded in a host engine via `ControlServer`.

pub mod address;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod headless;
pub mod listener;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod stepping;

#[cfg(test)]
mod testing;

pub use client::NetClient;
pub use config::ServerConfig;
pub use error::{ClientError, ConfigError, ServerError};
pub use headless::{HeadlessHandle, HeadlessSimulation, ProxyCall, start_headless_server};
pub use listener::ConnectionListener;
pub use proxy::{
    AgentResetCompletion, CaptureCompletion, CapturePipeline, SimulationProxy, SimulationWorld,
};
pub use server::{ControlServer, InboundMessage, ServerHandle};
pub use stepping::SteppingState;
