//! Simulated board server.
//!
//! Speaks the board wire protocol over real TCP so the driver and worker run
//! unchanged against it. A run executes instantly up to the next stop marker:
//! a mid-matrix `BIT_STOP` row parks the board in `RUN|WAIT` until
//! [`SimHandle::fire_restart_trigger`], the final row ends the run with
//! `END`. Used for `simulate = true` worker configs and in tests.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use fpgacompiler_backend::words::{
    BIT_STOP, STATUS_END, STATUS_RUN, STATUS_WAIT,
};

use crate::protocol::{
    read_opcode, read_samples_body, ConfigPacket, StatusRsp, RSP_ACK, OP_CLOSE, OP_CONFIG,
    OP_OPEN, OP_RESET, OP_START, OP_STATUS, OP_STATUS_FULL, OP_STATUS_IRQ, OP_STOP, OP_WRITE,
};

#[derive(Default)]
struct SimState {
    opened: bool,
    config: ConfigPacket,
    words: Vec<u32>,
    status: StatusRsp,
    /// Row index execution continues from after a restart trigger.
    resume_row: usize,
}

impl SimState {
    fn row_len(&self) -> usize {
        (self.config.transfer as usize).max(2)
    }

    fn rows(&self) -> usize {
        self.words.len() / self.row_len()
    }

    fn row(&self, i: usize) -> &[u32] {
        let len = self.row_len();
        &self.words[i * len..(i + 1) * len]
    }

    /// Executes rows from `resume_row`: parks at a mid-matrix stop marker,
    /// otherwise runs to the end.
    fn advance(&mut self) {
        let rows = self.rows();
        if rows == 0 {
            self.status = StatusRsp { status: STATUS_END, board_time: 0, board_samples: 0 };
            return;
        }
        let mut i = self.resume_row;
        while i < rows {
            let row = self.row(i);
            let tick = row[0];
            let stop = row[1..].iter().any(|&w| w & BIT_STOP != 0);
            self.status.board_time = tick;
            self.status.board_samples = (i + 1) as u32;
            if stop && i + 1 < rows {
                self.status.status = STATUS_RUN | STATUS_WAIT;
                self.resume_row = i + 1;
                return;
            }
            i += 1;
        }
        self.status.status = STATUS_END;
        self.resume_row = rows;
    }

    fn reset(&mut self) {
        self.status = StatusRsp::default();
        self.resume_row = 0;
        self.words.clear();
    }
}

/// Handle for poking the simulated hardware from outside the protocol.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Fires the external restart trigger, releasing a board parked at a
    /// mid-matrix stop marker.
    pub fn fire_restart_trigger(&self) {
        let mut state = self.state.lock();
        if state.status.status & STATUS_WAIT != 0 {
            state.advance();
        }
    }

    pub fn status(&self) -> StatusRsp {
        self.state.lock().status
    }
}

pub struct SimBoard {
    addr: SocketAddr,
    state: Arc<Mutex<SimState>>,
    shutdown: Arc<AtomicBool>,
}

impl SimBoard {
    /// Binds a fresh simulated board on an ephemeral localhost port.
    pub fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let state: Arc<Mutex<SimState>> = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let state = state.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new().name(format!("simboard-{}", addr.port())).spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            if let Err(e) = serve(stream, &state) {
                                log::debug!("sim board {}: connection ended: {}", addr, e);
                            }
                        }
                        Err(e) => {
                            log::warn!("sim board {}: accept failed: {}", addr, e);
                            break;
                        }
                    }
                }
            })?;
        }
        Ok(Self { addr, state, shutdown })
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle { state: self.state.clone() }
    }
}

impl Drop for SimBoard {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop
        let _ = TcpStream::connect(self.addr);
    }
}

fn ack(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(&RSP_ACK)
}

fn serve(mut stream: TcpStream, state: &Arc<Mutex<SimState>>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let op = match read_opcode(&mut stream) {
            Ok(op) => op,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match op {
            OP_OPEN => {
                state.lock().opened = true;
                ack(&mut stream)?;
            }
            OP_RESET => {
                state.lock().reset();
                ack(&mut stream)?;
            }
            OP_CONFIG => {
                let cfg = ConfigPacket::read_body(&mut stream)?;
                state.lock().config = cfg;
                // Echo the accepted configuration
                cfg.write_to(&mut stream)?;
            }
            OP_WRITE => {
                let words = read_samples_body(&mut stream)?;
                state.lock().words = words;
                ack(&mut stream)?;
            }
            OP_START => {
                {
                    let mut st = state.lock();
                    st.resume_row = 0;
                    st.status = StatusRsp { status: STATUS_RUN, board_time: 0, board_samples: 0 };
                    st.advance();
                }
                ack(&mut stream)?;
            }
            OP_STATUS | OP_STATUS_IRQ | OP_STATUS_FULL => {
                let status = state.lock().status;
                status.write_to(&mut stream, &op)?;
            }
            OP_STOP => {
                {
                    let mut st = state.lock();
                    st.status.status &= !(STATUS_RUN | STATUS_WAIT);
                    st.status.status |= STATUS_END;
                }
                ack(&mut stream)?;
            }
            OP_CLOSE => {
                state.lock().opened = false;
                ack(&mut stream)?;
                return Ok(());
            }
            other => {
                log::warn!("sim board: unknown opcode {:?}", other);
                stream.write_all(b"NACK")?;
            }
        }
    }
}
