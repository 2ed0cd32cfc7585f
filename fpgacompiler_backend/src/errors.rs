//! Error types for graph construction, compilation and the shot store.
//!
//! User-input errors fail synchronously with full context (channel name,
//! connection string, time, value). Timing conflicts found during a matrix
//! build are collected and reported as one tabulated [`ConflictTable`] at the
//! end of the build.

use std::fmt;

use thiserror::Error;

/// One offending row of a timing-conflict report.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRow {
    pub channel: String,
    pub rack: u8,
    pub address: u8,
    pub sample_index: usize,
    pub time: f64,
    pub old_word: u32,
    pub new_word: u32,
}

/// All timing conflicts collected during one matrix build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictTable {
    pub rows: Vec<ConflictRow>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
    pub fn push(&mut self, row: ConflictRow) {
        self.rows.push(row);
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

impl fmt::Display for ConflictTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} timing conflict(s):", self.rows.len())?;
        writeln!(
            f,
            "{:<20} {:>4} {:>6} {:>8} {:>12} {:>10} {:>10}",
            "channel", "rack", "addr", "sample", "time/s", "old", "new"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<20} {:>4} {:>#6x} {:>8} {:>12.6e} {:>#10x} {:>#10x}",
                row.channel, row.rack, row.address, row.sample_index, row.time, row.old_word, row.new_word
            )?;
        }
        Ok(())
    }
}

/// Unit-conversion failures carry the offending equation and value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("cannot parse conversion equation '{equation}' at position {pos}: {msg}")]
    Parse { equation: String, pos: usize, msg: String },
    #[error("conversion '{equation}' did not converge inverting value {value}")]
    NoConvergence { equation: String, value: f64 },
    #[error("conversion '{equation}' produced a non-finite result for value {value}")]
    NotFinite { equation: String, value: f64 },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("shot store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("shot store (de)serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("shot store key not found: {0}")]
    MissingKey(String),
    #[error("shot store dataset {key} has unexpected kind (wanted {wanted})")]
    WrongKind { key: String, wanted: &'static str },
}

/// Errors raised while building the board graph or compiling the sample matrix.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("channel '{channel}': invalid connection string '{connection}'")]
    InvalidConnection { channel: String, connection: String },

    #[error("channel name '{0}' already registered in the experiment")]
    DuplicateName(String),

    #[error("board name '{0}' already registered in the experiment")]
    DuplicateBoard(String),

    #[error("no board named '{0}' in the experiment")]
    NoSuchBoard(String),

    #[error("no channel named '{0}' in the experiment")]
    NoSuchChannel(String),

    #[error(
        "board '{board}' rack {rack}: address {address:#x} is claimed by both \
         '{first}' and '{second}' which belong to different device groups"
    )]
    DuplicateAddress { board: String, rack: u8, address: u8, first: String, second: String },

    #[error("board '{board}': rack {rack} is out of range (board has {num_racks} rack(s))")]
    RackOutOfRange { board: String, rack: u8, num_racks: u8 },

    #[error("board '{board}': bus rate {rate} Hz exceeds the maximum of {max} Hz")]
    BusRateTooHigh { board: String, rate: f64, max: f64 },

    #[error("board '{board}': a board drives 1 or 2 racks, got {num_racks}")]
    BadRackCount { board: String, num_racks: u8 },

    #[error("DDS channel '{channel}': address {address:#x} must be a multiple of 4")]
    DdsAlignment { channel: String, address: u8 },

    #[error("secondary board '{board}' requires a free digital channel on its primary for a hardware trigger")]
    MissingTrigger { board: String },

    #[error("channel '{channel}': time {time} s is negative")]
    NegativeTime { channel: String, time: f64 },

    #[error(
        "DDS channel '{channel}': programmings at t={prev} s and t={time} s are closer \
         than the device minimum time step of {min_step} s"
    )]
    DdsTooClose { channel: String, prev: f64, time: f64, min_step: f64 },

    #[error("board '{board}': tick {tick} exceeds the 32-bit tick counter")]
    TickOverflow { board: String, tick: u64 },

    #[error("channel '{channel}': instruction at t={time} s (tick {tick}) collides with an earlier instruction on the same channel")]
    TimeCollision { channel: String, time: f64, tick: u64 },

    #[error("channel '{channel}': value {value} outside limits [{min}, {max}]")]
    ValueOutOfRange { channel: String, value: f64, min: f64, max: f64 },

    #[error("channel '{channel}': ramp interval t0={t0} .. t1={t1} with clock rate {clock_rate} Hz is empty or inverted")]
    BadRamp { channel: String, t0: f64, t1: f64, clock_rate: f64 },

    #[error("channel '{channel}': series arrays have mismatched lengths ({times} times, {values} values)")]
    BadSeries { channel: String, times: usize, values: usize },

    #[error(
        "board '{board}' rack {rack}: strobe toggling suppressed on the first sample; \
         the board always executes the first sample, insert an explicit earlier sample instead"
    )]
    StrobeOnFirstSample { board: String, rack: u8 },

    #[error("sample matrix build aborted:\n{0}")]
    Conflicts(ConflictTable),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
