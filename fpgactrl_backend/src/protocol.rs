//! Wire protocol between the control PC and the boards.
//!
//! Every message starts with a 4-byte ASCII opcode. Requests are answered
//! with `ACK!`, `NACK` or an opcode-echoing response packet. All multi-byte
//! header fields are big-endian; the bulk sample stream of a `WRIT` message
//! is raw little-endian `u32` words as compiled by the matrix builder.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub type Opcode = [u8; 4];

pub const OP_OPEN: Opcode = *b"OPEN";
pub const OP_RESET: Opcode = *b"RSET";
pub const OP_CONFIG: Opcode = *b"CONF";
pub const OP_WRITE: Opcode = *b"WRIT";
pub const OP_START: Opcode = *b"STRT";
pub const OP_STATUS: Opcode = *b"STAT";
/// Status request that parks on the board until the next IRQ (wait, end or
/// error) instead of answering immediately.
pub const OP_STATUS_IRQ: Opcode = *b"STIR";
/// Extended status with the full register dump.
pub const OP_STATUS_FULL: Opcode = *b"STFL";
pub const OP_STOP: Opcode = *b"STOP";
pub const OP_CLOSE: Opcode = *b"CLSE";

pub const RSP_ACK: Opcode = *b"ACK!";
pub const RSP_NACK: Opcode = *b"NACK";

pub fn opcode_str(op: &Opcode) -> String {
    op.iter().map(|&b| if b.is_ascii_graphic() { b as char } else { '?' }).collect()
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("protocol i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("expected opcode {expected}, received {received}")]
    UnexpectedOpcode { expected: String, received: String },
    #[error("board rejected {op} with NACK")]
    Nack { op: String },
}

pub fn read_opcode<R: Read>(r: &mut R) -> io::Result<Opcode> {
    let mut op = [0u8; 4];
    r.read_exact(&mut op)?;
    Ok(op)
}

pub fn write_opcode<W: Write>(w: &mut W, op: &Opcode) -> io::Result<()> {
    w.write_all(op)
}

/// Checks an `ACK!`/`NACK` reply to `op`.
pub fn read_ack<R: Read>(r: &mut R, op: &Opcode) -> Result<(), ProtocolError> {
    let rsp = read_opcode(r)?;
    match rsp {
        RSP_ACK => Ok(()),
        RSP_NACK => Err(ProtocolError::Nack { op: opcode_str(op) }),
        other => Err(ProtocolError::UnexpectedOpcode {
            expected: opcode_str(&RSP_ACK),
            received: opcode_str(&other),
        }),
    }
}

// ---- configuration ---------------------------------------------------------

/// Control-register bits of the CONFIG packet.
pub const CTRL_AUTO_SYNC_EN: u32 = 1 << 0;
pub const CTRL_AUTO_SYNC_PRIM: u32 = 1 << 1;
pub const CTRL_EXT_CLK: u32 = 1 << 2;
pub const CTRL_ERR_LOCK_EN: u32 = 1 << 3;
/// 64-bit samples: tick + one rack word.
pub const CTRL_RUN_64: u32 = 1 << 4;
/// 96-bit samples: tick + two rack words.
pub const CTRL_RUN_96: u32 = 1 << 5;

/// `sync_wait` value releasing the board immediately (no rendezvous hold).
pub const SYNC_WAIT_SINGLE: u32 = 0;
/// `sync_phase` value disabling the external-clock phase shift.
pub const SYNC_PHASE_NONE: u32 = 0;

/// Signal sources routable to a trigger input or control output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlSource {
    None = 0,
    In0 = 1,
    In1 = 2,
    In2 = 3,
    Data28 = 4,
    Data29 = 5,
    Data30 = 6,
    Data31 = 7,
    SyncOut = 8,
    Run = 9,
    Wait = 10,
    Error = 11,
    Strb0 = 12,
    Strb1 = 13,
    ExtClkLocked = 14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlLevel {
    Rising = 0,
    Falling = 1,
    High = 2,
    Low = 3,
}

/// Trigger-input destinations of `ctrl_in`; each occupies one byte lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlInDest {
    Start = 0,
    Stop = 1,
    Restart = 2,
}

/// Output destinations of `ctrl_out`; each occupies one byte lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlOutDest {
    Out0 = 0,
    Out1 = 1,
    Out2 = 2,
}

impl From<CtrlInDest> for u32 {
    fn from(dest: CtrlInDest) -> u32 {
        dest as u32
    }
}
impl From<CtrlOutDest> for u32 {
    fn from(dest: CtrlOutDest) -> u32 {
        dest as u32
    }
}

/// Packs `(dest, source, level)` routings into one control register.
/// Source occupies bits 0-3 and level bits 4-5 of the destination's byte.
pub fn pack_ctrl<D: Copy + Into<u32>>(routings: &[(D, CtrlSource, CtrlLevel)]) -> u32 {
    let mut reg = 0u32;
    for &(dest, source, level) in routings {
        let lane = dest.into() * 8;
        let entry = (source as u32) | ((level as u32) << 4);
        reg &= !(0xffu32 << lane);
        reg |= entry << lane;
    }
    reg
}

/// The CONFIG packet, 11 big-endian `u32` fields starting with the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigPacket {
    /// Bus clock divider from the FPGA base clock.
    pub clock_div: u32,
    /// Strobe scan divider.
    pub scan_div: u32,
    pub control: u32,
    pub ctrl_in: u32,
    pub ctrl_out: u32,
    /// Number of run repetitions; 0 runs forever.
    pub cycles: u32,
    /// Words per sample row in the WRIT stream.
    pub transfer: u32,
    /// Strobe delay in base-clock cycles.
    pub strb_delay: u32,
    pub sync_wait: u32,
    pub sync_phase: u32,
}

impl ConfigPacket {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_opcode(w, &OP_CONFIG)?;
        for field in [
            self.clock_div,
            self.scan_div,
            self.control,
            self.ctrl_in,
            self.ctrl_out,
            self.cycles,
            self.transfer,
            self.strb_delay,
            self.sync_wait,
            self.sync_phase,
        ] {
            w.write_u32::<BigEndian>(field)?;
        }
        Ok(())
    }

    /// Reads the packet body; the opcode has already been consumed.
    pub fn read_body<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut fields = [0u32; 10];
        for field in fields.iter_mut() {
            *field = r.read_u32::<BigEndian>()?;
        }
        Ok(Self {
            clock_div: fields[0],
            scan_div: fields[1],
            control: fields[2],
            ctrl_in: fields[3],
            ctrl_out: fields[4],
            cycles: fields[5],
            transfer: fields[6],
            strb_delay: fields[7],
            sync_wait: fields[8],
            sync_phase: fields[9],
        })
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let op = read_opcode(r)?;
        if op != OP_CONFIG {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: opcode_str(&OP_CONFIG),
                received: opcode_str(&op),
            });
        }
        Ok(Self::read_body(r)?)
    }
}

// ---- status ----------------------------------------------------------------

/// Status response, echoed for `STAT`, `STIR` and at run end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRsp {
    pub status: u32,
    /// Board time in bus ticks.
    pub board_time: u32,
    /// Samples executed so far.
    pub board_samples: u32,
}

impl StatusRsp {
    pub fn write_to<W: Write>(&self, w: &mut W, op: &Opcode) -> io::Result<()> {
        write_opcode(w, op)?;
        w.write_u32::<BigEndian>(self.status)?;
        w.write_u32::<BigEndian>(self.board_time)?;
        w.write_u32::<BigEndian>(self.board_samples)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, expected: &Opcode) -> Result<Self, ProtocolError> {
        let op = read_opcode(r)?;
        if op != *expected {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: opcode_str(expected),
                received: opcode_str(&op),
            });
        }
        Ok(Self {
            status: r.read_u32::<BigEndian>()?,
            board_time: r.read_u32::<BigEndian>()?,
            board_samples: r.read_u32::<BigEndian>()?,
        })
    }
}

// ---- sample stream ---------------------------------------------------------

/// Writes a WRIT message: opcode, byte count, then the raw sample words.
pub fn write_samples<W: Write>(w: &mut W, words: &[u32]) -> io::Result<()> {
    write_opcode(w, &OP_WRITE)?;
    w.write_u32::<BigEndian>((words.len() * 4) as u32)?;
    for &word in words {
        w.write_u32::<LittleEndian>(word)?;
    }
    Ok(())
}

/// Reads a WRIT body (opcode already consumed) into sample words.
pub fn read_samples_body<R: Read>(r: &mut R) -> io::Result<Vec<u32>> {
    let bytes = r.read_u32::<BigEndian>()? as usize;
    let mut words = vec![0u32; bytes / 4];
    for word in words.iter_mut() {
        *word = r.read_u32::<LittleEndian>()?;
    }
    Ok(words)
}

impl fmt::Display for StatusRsp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status {:#010b}, time {} ticks, {} samples",
            self.status, self.board_time, self.board_samples
        )
    }
}
