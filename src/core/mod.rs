//! Runtime core: root supervisor wiring and OS signal handling.
//!
//! - **supervisor.rs**: owns every subsystem, wires the bus subscribers
//!   and thermal hooks, runs the main loop and drives the reverse-order
//!   graceful shutdown.
//! - **shutdown.rs**: waits for SIGINT/SIGTERM.

mod shutdown;
mod supervisor;

pub use supervisor::Supervisor;
