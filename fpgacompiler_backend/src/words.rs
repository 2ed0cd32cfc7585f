//! Bus-word and board-status bit layouts.
//!
//! Every sample streamed to a board is one 32-bit word per rack:
//!
//! | bits  | meaning                        |
//! |-------|--------------------------------|
//! | 31    | `BIT_NOP` (sent, not executed) |
//! | 30    | `BIT_STOP`                     |
//! | 29    | `BIT_STRB`                     |
//! | 28-24 | reserved / device control      |
//! | 23-18 | device address (6 bits)        |
//! | 17-0  | data payload                   |
//!
//! The shifts below must match the FPGA firmware's field decoding bit-for-bit;
//! do not change them without a firmware release.

/// Highest bus rate any supported board can be clocked at, in Hz.
pub const MAX_FPGA_RATE: f64 = 40e6;
/// Default bus rate used when a board does not specify one, in Hz.
pub const DEFAULT_BUS_RATE: f64 = 1e6;
/// Minimum gap between two samples on the same rack, in bus ticks.
pub const TIME_STEP: u64 = 1;

pub const BIT_NOP: u32 = 1 << 31;
pub const BIT_STOP: u32 = 1 << 30;
pub const BIT_STRB: u32 = 1 << 29;

pub const ADDR_SHIFT: u32 = 18;
pub const ADDR_BITS: u32 = 6;
pub const ADDR_MASK: u32 = (1 << ADDR_BITS) - 1;
pub const DATA_MASK: u32 = (1 << ADDR_SHIFT) - 1;

/// Packs a device address and payload into a bus word with no control bits set.
pub fn pack(address: u8, data: u32) -> u32 {
    debug_assert!((address as u32) <= ADDR_MASK, "address {address:#x} exceeds 6 bits");
    debug_assert!(data <= DATA_MASK, "data {data:#x} exceeds 18 bits");
    ((address as u32 & ADDR_MASK) << ADDR_SHIFT) | (data & DATA_MASK)
}

pub fn address_of(word: u32) -> u8 {
    ((word >> ADDR_SHIFT) & ADDR_MASK) as u8
}

pub fn data_of(word: u32) -> u32 {
    word & DATA_MASK
}

pub fn is_nop(word: u32) -> bool {
    word & BIT_NOP != 0
}

pub fn is_stop(word: u32) -> bool {
    word & BIT_STOP != 0
}

pub fn strb_of(word: u32) -> bool {
    word & BIT_STRB != 0
}

// Board status word bits, as reported in STATUS responses.
pub const STATUS_RUN: u32 = 1 << 0;
pub const STATUS_END: u32 = 1 << 1;
pub const STATUS_WAIT: u32 = 1 << 2;
pub const STATUS_EXT_LOCKED: u32 = 1 << 3;
pub const STATUS_ERR_LOCK: u32 = 1 << 4;
pub const STATUS_ERROR: u32 = 1 << 5;

/// Decoded board status: raw status bits plus elapsed ticks and executed samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardStatus {
    pub status: u32,
    pub board_time: u32,
    pub board_samples: u32,
}

impl BoardStatus {
    pub fn new(status: u32, board_time: u32, board_samples: u32) -> Self {
        Self { status, board_time, board_samples }
    }
    pub fn is_running(&self) -> bool {
        self.status & STATUS_RUN != 0
    }
    pub fn is_end(&self) -> bool {
        self.status & STATUS_END != 0
    }
    pub fn is_waiting(&self) -> bool {
        self.status & STATUS_WAIT != 0
    }
    pub fn has_error(&self) -> bool {
        self.status & STATUS_ERROR != 0
    }
    /// External clock lock was lost at some point during the run.
    pub fn clock_lost(&self) -> bool {
        self.status & STATUS_ERR_LOCK != 0
    }
    /// Error with a cause other than the (possibly ignorable) lock loss.
    pub fn fatal_error(&self) -> bool {
        self.has_error() && !self.clock_lost()
    }
}
