//! Board client state machine.
//!
//! One [`BoardClient`] owns the TCP connection to one board and tracks its
//! protocol state:
//!
//! ```text
//! Closed -> Connected -> Open -> Idle -> Ready -> Armed -> Running
//!                (TCP)   (OPEN)  (RSET)  (CONF)   (WRIT)   (STRT)
//! ```
//!
//! `STOP` returns a running or armed board to `Idle`; `CLSE` returns any
//! state to `Closed`. Sending an operation from the wrong state fails with
//! [`DriverError::BadState`] before anything goes on the wire.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;

use fpgacompiler_backend::words::BoardStatus;

use crate::protocol::{
    opcode_str, read_ack, write_opcode, write_samples, ConfigPacket, ProtocolError, StatusRsp,
    OP_CLOSE, OP_OPEN, OP_RESET, OP_START, OP_STATUS, OP_STATUS_IRQ, OP_STOP,
    SYNC_PHASE_NONE, SYNC_WAIT_SINGLE,
};

/// Socket timeout for ordinary request/response exchanges.
pub const SOCK_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout for `STIR`, which parks on the board until the next IRQ.
pub const SOCK_TIMEOUT_IRQ: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BoardState {
    Closed,
    Connected,
    Open,
    Idle,
    Ready,
    Armed,
    Running,
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("board '{board}': {source}")]
    Protocol {
        board: String,
        #[source]
        source: ProtocolError,
    },
    #[error("board '{board}': i/o error: {source}")]
    Io {
        board: String,
        #[source]
        source: io::Error,
    },
    #[error("board '{board}': cannot send {op} in state {state}")]
    BadState { board: String, op: &'static str, state: BoardState },
    #[error("board '{board}': stored matrix CRC {stored:#010x} does not match computed {computed:#010x}")]
    CrcMismatch { board: String, stored: u32, computed: u32 },
    #[error("board '{board}': synchronization failed: {reason}")]
    SyncFailed { board: String, reason: String },
    #[error("board '{board}': run failed: {reason}")]
    RunFailed { board: String, reason: String },
    #[error(transparent)]
    Store(#[from] fpgacompiler_backend::StoreError),
}

/// What a status word means for the supervising worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunInterpretation {
    /// Board is executing samples.
    Running,
    /// Board waits at sample 0 for its external start trigger.
    ExternalStartWait,
    /// Board paused at a mid-run stop marker, waiting for the restart trigger.
    RestartWait,
    /// Clean end of run; sample count and end time both matched.
    Finished,
    /// Run ended but the executed sample count or end time differs.
    EndMismatch {
        got_samples: u32,
        expected_samples: u32,
        got_time: u32,
        expected_time: u32,
    },
    /// External clock lock was lost; fatal unless the run ignores it.
    ClockLost { fatal: bool },
    /// Unrecoverable board error; the worker aborts via STOP.
    Fatal,
}

/// Decodes a board status against the run's expectations. A clean end
/// requires both the executed sample count and the board clock at the end
/// of the run to match the compiled matrix.
pub fn interpret_status(
    status: BoardStatus,
    expected_samples: u32,
    expected_time: u32,
    ignore_clock_loss: bool,
) -> RunInterpretation {
    if status.fatal_error() {
        return RunInterpretation::Fatal;
    }
    if status.clock_lost() {
        return RunInterpretation::ClockLost { fatal: !ignore_clock_loss };
    }
    if status.is_end() {
        if status.board_samples == expected_samples && status.board_time == expected_time {
            return RunInterpretation::Finished;
        }
        return RunInterpretation::EndMismatch {
            got_samples: status.board_samples,
            expected_samples,
            got_time: status.board_time,
            expected_time,
        };
    }
    if status.is_running() && status.is_waiting() {
        return RunInterpretation::RestartWait;
    }
    if status.is_waiting() && status.board_time == 0 {
        return RunInterpretation::ExternalStartWait;
    }
    RunInterpretation::Running
}

pub struct BoardClient {
    name: String,
    endpoint: String,
    stream: Option<TcpStream>,
    state: BoardState,
}

impl BoardClient {
    pub fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            stream: None,
            state: BoardState::Closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn state(&self) -> BoardState {
        self.state
    }

    fn require(&self, op: &'static str, allowed: &[BoardState]) -> Result<(), DriverError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DriverError::BadState { board: self.name.clone(), op, state: self.state })
        }
    }

    /// The live stream plus an owned board name for error reporting.
    fn stream(&mut self) -> Result<(String, &mut TcpStream), DriverError> {
        let name = self.name.clone();
        match self.stream.as_mut() {
            Some(stream) => Ok((name, stream)),
            None => Err(DriverError::BadState { board: name, op: "i/o", state: BoardState::Closed }),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        let (name, stream) = self.stream()?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| DriverError::Io { board: name, source: e })
    }

    /// Opens the TCP connection; the board is then `Connected` but not owned.
    pub fn connect(&mut self) -> Result<(), DriverError> {
        self.require("connect", &[BoardState::Closed])?;
        let addr: std::net::SocketAddr = self.endpoint.parse().map_err(|e| DriverError::Io {
            board: self.name.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", self.endpoint, e)),
        })?;
        let stream = TcpStream::connect_timeout(&addr, SOCK_TIMEOUT)
            .map_err(|e| DriverError::Io { board: self.name.clone(), source: e })?;
        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::Io { board: self.name.clone(), source: e })?;
        self.stream = Some(stream);
        self.state = BoardState::Connected;
        self.set_timeout(SOCK_TIMEOUT)?;
        log::debug!("board '{}': connected to {}", self.name, self.endpoint);
        Ok(())
    }

    /// Drops and re-establishes the connection, re-acquiring the board.
    /// Used for the single manual-mode retry after an i/o failure.
    pub fn reconnect(&mut self) -> Result<(), DriverError> {
        log::warn!("board '{}': reconnecting to {}", self.name, self.endpoint);
        self.stream = None;
        self.state = BoardState::Closed;
        self.connect()?;
        self.open()?;
        self.reset()
    }

    fn simple_op(
        &mut self,
        op: &'static str,
        opcode: &crate::protocol::Opcode,
        allowed: &[BoardState],
        next: BoardState,
    ) -> Result<(), DriverError> {
        self.require(op, allowed)?;
        let opcode = *opcode;
        let (name, stream) = self.stream()?;
        write_opcode(stream, &opcode)
            .map_err(|e| DriverError::Io { board: name.clone(), source: e })?;
        match read_ack(stream, &opcode) {
            Ok(()) => {
                self.state = next;
                log::debug!("board '{}': {} -> {}", self.name, opcode_str(&opcode), next);
                Ok(())
            }
            Err(e) => {
                log::error!("board '{}': {} failed: {}", name, opcode_str(&opcode), e);
                Err(match e {
                    ProtocolError::Io(e) => DriverError::Io { board: name, source: e },
                    other => DriverError::Protocol { board: name, source: other },
                })
            }
        }
    }

    /// Takes exclusive ownership of the board.
    pub fn open(&mut self) -> Result<(), DriverError> {
        self.simple_op("open", &OP_OPEN, &[BoardState::Connected], BoardState::Open)
    }

    /// Resets the board to a clean idle state. Allowed from any owned state,
    /// including aborting an active run.
    pub fn reset(&mut self) -> Result<(), DriverError> {
        self.simple_op(
            "reset",
            &OP_RESET,
            &[BoardState::Open, BoardState::Idle, BoardState::Ready, BoardState::Armed, BoardState::Running],
            BoardState::Idle,
        )
    }

    /// Sends the run configuration; the board echoes the packet back.
    pub fn configure(&mut self, cfg: &ConfigPacket) -> Result<(), DriverError> {
        self.require("configure", &[BoardState::Idle, BoardState::Ready])?;
        let (name, stream) = self.stream()?;
        cfg.write_to(stream).map_err(|e| DriverError::Io { board: name.clone(), source: e })?;
        let echoed = ConfigPacket::read_from(stream).map_err(|e| match e {
            ProtocolError::Io(e) => DriverError::Io { board: name.clone(), source: e },
            other => DriverError::Protocol { board: name.clone(), source: other },
        })?;
        if echoed != *cfg {
            log::warn!(
                "board '{}': configuration echo differs (sent {:?}, received {:?})",
                name,
                cfg,
                echoed
            );
        }
        self.state = BoardState::Ready;
        Ok(())
    }

    /// Streams the compiled sample matrix, row-major.
    pub fn write_samples(&mut self, words: &[u32]) -> Result<(), DriverError> {
        self.require("write", &[BoardState::Ready])?;
        let (name, stream) = self.stream()?;
        write_samples(stream, words)
            .map_err(|e| DriverError::Io { board: name.clone(), source: e })?;
        read_ack(stream, &crate::protocol::OP_WRITE).map_err(|e| match e {
            ProtocolError::Io(e) => DriverError::Io { board: name.clone(), source: e },
            other => DriverError::Protocol { board: name, source: other },
        })?;
        self.state = BoardState::Armed;
        log::debug!("board '{}': wrote {} words", self.name, words.len());
        Ok(())
    }

    /// Starts the run. Allowed from `Idle` too: the board retains the last
    /// uploaded matrix across runs, which the worker's cache relies on.
    pub fn start(&mut self) -> Result<(), DriverError> {
        self.simple_op(
            "start",
            &OP_START,
            &[BoardState::Armed, BoardState::Idle],
            BoardState::Running,
        )
    }

    /// Stops an active or armed run; the board returns to `Idle`.
    pub fn stop(&mut self) -> Result<(), DriverError> {
        self.simple_op(
            "stop",
            &OP_STOP,
            &[BoardState::Running, BoardState::Armed, BoardState::Ready],
            BoardState::Idle,
        )
    }

    pub fn close(&mut self) -> Result<(), DriverError> {
        if self.state == BoardState::Closed {
            return Ok(());
        }
        let result = self.simple_op(
            "close",
            &OP_CLOSE,
            &[
                BoardState::Connected,
                BoardState::Open,
                BoardState::Idle,
                BoardState::Ready,
                BoardState::Armed,
                BoardState::Running,
            ],
            BoardState::Closed,
        );
        self.stream = None;
        self.state = BoardState::Closed;
        result
    }

    fn status_op(&mut self, opcode: crate::protocol::Opcode) -> Result<BoardStatus, DriverError> {
        self.require("status", &[BoardState::Idle, BoardState::Ready, BoardState::Armed, BoardState::Running])?;
        let (name, stream) = self.stream()?;
        write_opcode(stream, &opcode)
            .map_err(|e| DriverError::Io { board: name.clone(), source: e })?;
        let rsp = StatusRsp::read_from(stream, &opcode).map_err(|e| match e {
            ProtocolError::Io(e) => DriverError::Io { board: name.clone(), source: e },
            other => DriverError::Protocol { board: name, source: other },
        })?;
        if rsp.status & fpgacompiler_backend::words::STATUS_END != 0 {
            self.state = BoardState::Idle;
        }
        Ok(BoardStatus::new(rsp.status, rsp.board_time, rsp.board_samples))
    }

    /// Immediate status poll.
    pub fn status(&mut self) -> Result<BoardStatus, DriverError> {
        self.set_timeout(SOCK_TIMEOUT)?;
        self.status_op(OP_STATUS)
    }

    /// Status request answered at the next board IRQ (wait, end or error).
    /// Blocks up to [`SOCK_TIMEOUT_IRQ`].
    pub fn status_irq(&mut self) -> Result<BoardStatus, DriverError> {
        self.set_timeout(SOCK_TIMEOUT_IRQ)?;
        let result = self.status_op(OP_STATUS_IRQ);
        self.set_timeout(SOCK_TIMEOUT)?;
        result
    }

    /// Releases a secondary board from rendezvous hold after a run: a second
    /// CONFIG restoring single-board sync settings.
    pub fn unlock(&mut self, base: &ConfigPacket) -> Result<(), DriverError> {
        let mut cfg = *base;
        cfg.sync_wait = SYNC_WAIT_SINGLE;
        cfg.sync_phase = SYNC_PHASE_NONE;
        cfg.control &= !(crate::protocol::CTRL_AUTO_SYNC_EN | crate::protocol::CTRL_AUTO_SYNC_PRIM);
        self.configure(&cfg)
    }
}

impl Drop for BoardClient {
    fn drop(&mut self) {
        if self.state != BoardState::Closed {
            let _ = self.close();
        }
    }
}
