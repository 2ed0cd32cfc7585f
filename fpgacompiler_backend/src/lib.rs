//! Compiler backend for FPGA-driven experiment control.
//!
//! This crate turns a timed description of an experiment, output channels on
//! one or more bus boards with instructions placed at absolute times, into
//! the per-board sample matrices the hardware streams out. The companion
//! `fpgactrl_backend` crate talks to the boards.
//!
//! The pipeline is:
//!
//! 1. Build the board graph with [`graph::Experiment`]: boards, clocklines,
//!    intermediate devices and channels.
//! 2. Place instructions (set-points, ramps, DDS programmings, digital
//!    edges) on the channels.
//! 3. Compile each board with [`matrix::build`] into a `(tick, rack words)`
//!    matrix with strobe alternation and conflict checking.
//! 4. Persist the compiled shot with [`shot::ShotFile`] for the workers.

pub mod conversion;
pub mod encoder;
pub mod errors;
pub mod graph;
pub mod instruction;
pub mod matrix;
pub mod shot;
pub mod utils;
pub mod words;

pub use conversion::*;
pub use encoder::*;
pub use errors::*;
pub use graph::*;
pub use instruction::*;
pub use matrix::*;
pub use shot::*;
pub use utils::*;
pub use words::*;
