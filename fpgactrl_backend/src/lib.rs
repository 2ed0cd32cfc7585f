//! Runtime backend for FPGA-driven experiment control.
//!
//! Companion crate to `fpgacompiler_backend`: takes the compiled shots the
//! compiler produces and runs them on the boards. [`protocol`] is the wire
//! codec, [`driver`] the per-board TCP client state machine, [`sync`] the
//! cross-board rendezvous, [`worker`] the per-board run loop, and [`sim`]
//! a protocol-complete simulated board for development and tests.

pub mod driver;
pub mod protocol;
pub mod sim;
pub mod sync;
pub mod worker;

pub use driver::*;
pub use protocol::*;
pub use sim::*;
pub use sync::*;
pub use worker::*;
