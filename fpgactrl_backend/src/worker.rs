//! Per-board runtime worker.
//!
//! One [`BoardWorker`] owns the client connection to one board and carries
//! it through the run cycle: `transition_to_buffered` loads a compiled shot,
//! verifies its checksum, programs the board and starts it in lockstep with
//! the other boards; `wait_until_done` supervises the run; and
//! `transition_to_manual` returns the board to immediate manual control.
//!
//! Order across boards matters. Into a buffered run the primary programs
//! first, rendezvouses, then starts, so its start trigger finds every
//! secondary armed; secondaries rendezvous before arming so a failed peer is
//! detected before anything is running. Back to manual the order reverses,
//! secondaries stop and unlock first.
//!
//! Workers run in their own threads and are driven over a crossbeam channel
//! by [`run_worker`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use fpgacompiler_backend::matrix::matrix_crc;
use fpgacompiler_backend::shot::ShotFile;
use fpgacompiler_backend::words::{BoardStatus, DEFAULT_BUS_RATE, MAX_FPGA_RATE};

use crate::driver::{interpret_status, BoardClient, BoardState, DriverError, RunInterpretation};
use crate::protocol::{
    pack_ctrl, ConfigPacket, CtrlInDest, CtrlLevel, CtrlOutDest, CtrlSource, CTRL_AUTO_SYNC_EN,
    CTRL_AUTO_SYNC_PRIM, CTRL_ERR_LOCK_EN, CTRL_EXT_CLK, CTRL_RUN_64, CTRL_RUN_96,
};
use crate::sim::{SimBoard, SimHandle};
use crate::sync::{EventHub, RemoteHub, SyncLink, SyncRole, SyncStatus};

/// Status poll cadence during a supervised run.
pub const UPDATE_TIME_MS: u64 = 100;

fn default_cycles() -> u32 {
    1
}

fn default_bus_rate() -> f64 {
    DEFAULT_BUS_RATE
}

/// Static per-board configuration; every field can be overridden per shot
/// through the stored `worker_args_ex` JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub board_name: String,
    pub endpoint: String,
    pub num_racks: u8,
    #[serde(default = "default_bus_rate")]
    pub bus_rate: f64,
    pub is_primary: bool,
    #[serde(default)]
    pub secondaries: Vec<String>,
    /// Trigger-input routings, destination -> (source, level).
    #[serde(default)]
    pub inputs: IndexMap<String, (String, String)>,
    /// Control-output routings, destination -> (source, level).
    #[serde(default)]
    pub outputs: IndexMap<String, (String, String)>,
    #[serde(default)]
    pub ext_clock: bool,
    #[serde(default)]
    pub ignore_clock_loss: bool,
    #[serde(default)]
    pub sync_wait: u32,
    #[serde(default)]
    pub sync_phase: u32,
    /// Endpoint of a cross-process rendezvous hub server; workers in one
    /// process leave this unset and share the hub directly.
    #[serde(default)]
    pub sync_server: Option<String>,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub strb_delay: u32,
}

fn parse_source(name: &str) -> Option<CtrlSource> {
    Some(match name {
        "none" => CtrlSource::None,
        "input 0" => CtrlSource::In0,
        "input 1" => CtrlSource::In1,
        "input 2" => CtrlSource::In2,
        "data 28" => CtrlSource::Data28,
        "data 29" => CtrlSource::Data29,
        "data 30" => CtrlSource::Data30,
        "data 31" => CtrlSource::Data31,
        "sync out" => CtrlSource::SyncOut,
        "run" => CtrlSource::Run,
        "wait" => CtrlSource::Wait,
        "error" => CtrlSource::Error,
        "strobe 0" => CtrlSource::Strb0,
        "strobe 1" => CtrlSource::Strb1,
        "clock locked" => CtrlSource::ExtClkLocked,
        _ => return None,
    })
}

fn parse_level(name: &str) -> Option<CtrlLevel> {
    Some(match name {
        "rising" => CtrlLevel::Rising,
        "falling" => CtrlLevel::Falling,
        "high" => CtrlLevel::High,
        "low" => CtrlLevel::Low,
        _ => return None,
    })
}

fn parse_in_dest(name: &str) -> Option<CtrlInDest> {
    Some(match name {
        "start" => CtrlInDest::Start,
        "stop" => CtrlInDest::Stop,
        "restart" => CtrlInDest::Restart,
        _ => return None,
    })
}

fn parse_out_dest(name: &str) -> Option<CtrlOutDest> {
    Some(match name {
        "out 0" => CtrlOutDest::Out0,
        "out 1" => CtrlOutDest::Out1,
        "out 2" => CtrlOutDest::Out2,
        _ => return None,
    })
}

impl WorkerConfig {
    /// Overlays per-shot overrides onto this configuration. Unknown keys are
    /// rejected by deserialization, so a typo in a shot file fails loudly.
    pub fn apply_args(&mut self, args: &Value) -> Result<(), serde_json::Error> {
        let overrides = match args {
            Value::Object(map) if !map.is_empty() => map,
            _ => return Ok(()),
        };
        let mut base = serde_json::to_value(&*self)?;
        if let Value::Object(map) = &mut base {
            for (key, value) in overrides {
                map.insert(key.clone(), value.clone());
            }
        }
        *self = serde_json::from_value(base)?;
        Ok(())
    }

    pub fn multi_board(&self) -> bool {
        self.is_primary && !self.secondaries.is_empty() || !self.is_primary
    }

    fn ctrl_in(&self) -> u32 {
        let mut routings = Vec::new();
        for (dest, (source, level)) in &self.inputs {
            match (parse_in_dest(dest), parse_source(source), parse_level(level)) {
                (Some(d), Some(s), Some(l)) => routings.push((d, s, l)),
                _ => log::warn!(
                    "board '{}': ignoring unknown input routing {} -> ({}, {})",
                    self.board_name, dest, source, level
                ),
            }
        }
        pack_ctrl(&routings)
    }

    fn ctrl_out(&self) -> u32 {
        let mut routings = Vec::new();
        for (dest, (source, level)) in &self.outputs {
            match (parse_out_dest(dest), parse_source(source), parse_level(level)) {
                (Some(d), Some(s), Some(l)) => routings.push((d, s, l)),
                _ => log::warn!(
                    "board '{}': ignoring unknown output routing {} -> ({}, {})",
                    self.board_name, dest, source, level
                ),
            }
        }
        pack_ctrl(&routings)
    }

    /// Builds the CONFIG packet for a buffered run.
    pub fn config_packet(&self) -> ConfigPacket {
        let clock_div = (MAX_FPGA_RATE / self.bus_rate).round() as u32;
        let mut control = if self.num_racks >= 2 { CTRL_RUN_96 } else { CTRL_RUN_64 };
        if self.ext_clock {
            control |= CTRL_EXT_CLK;
            if !self.ignore_clock_loss {
                control |= CTRL_ERR_LOCK_EN;
            }
        }
        if self.multi_board() {
            control |= CTRL_AUTO_SYNC_EN;
            if self.is_primary {
                control |= CTRL_AUTO_SYNC_PRIM;
            }
        }
        ConfigPacket {
            clock_div,
            scan_div: clock_div,
            control,
            ctrl_in: self.ctrl_in(),
            ctrl_out: self.ctrl_out(),
            cycles: self.cycles,
            transfer: 1 + self.num_racks as u32,
            strb_delay: self.strb_delay,
            sync_wait: self.sync_wait,
            sync_phase: self.sync_phase,
        }
    }
}

/// What the last programmed run looked like; a matching next shot skips the
/// matrix upload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunCache {
    identity: String,
    matrix_crc: u32,
    args_fingerprint: String,
}

/// Outcome of one supervised run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunInterpretation,
    pub warnings: u32,
    pub status: BoardStatus,
}

pub struct BoardWorker {
    cfg: WorkerConfig,
    client: Option<BoardClient>,
    sim: Option<SimBoard>,
    sync: SyncLink,
    sync_remote: bool,
    cache: Option<RunCache>,
    /// Effective configuration of the current shot (static + overrides).
    run_cfg: WorkerConfig,
    expected_samples: u32,
    expected_time: u32,
    sync_pending_reset: bool,
    last_report: Option<RunReport>,
    cycle_status: IndexMap<String, Value>,
}

impl BoardWorker {
    pub fn new(cfg: WorkerConfig, hub: EventHub) -> Self {
        let role = if cfg.is_primary {
            SyncRole::Primary { secondaries: cfg.secondaries.clone() }
        } else {
            SyncRole::Secondary { name: cfg.board_name.clone() }
        };
        let sync = SyncLink::new(hub, role);
        Self {
            run_cfg: cfg.clone(),
            cfg,
            client: None,
            sim: None,
            sync,
            sync_remote: false,
            cache: None,
            expected_samples: 0,
            expected_time: 0,
            sync_pending_reset: false,
            last_report: None,
            cycle_status: IndexMap::new(),
        }
    }

    pub fn board_name(&self) -> &str {
        &self.cfg.board_name
    }

    /// The simulated hardware handle, present when `simulate = true`.
    pub fn sim_handle(&self) -> Option<SimHandle> {
        self.sim.as_ref().map(|s| s.handle())
    }

    /// Shrinks the rendezvous budget; mainly for tests.
    pub fn set_sync_timeout(&mut self, timeout: Duration) {
        self.sync.set_timeout(timeout);
    }

    /// Report of the last supervised run, if one finished.
    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    /// Per-board status payloads exchanged at the end of the last cycle.
    pub fn cycle_status(&self) -> &IndexMap<String, Value> {
        &self.cycle_status
    }

    fn err_run(&self, reason: impl Into<String>) -> DriverError {
        DriverError::RunFailed { board: self.cfg.board_name.clone(), reason: reason.into() }
    }

    /// Connects, opens and resets the board if not yet owned. Spawns the
    /// simulated board first when configured to.
    fn ensure_connected(&mut self) -> Result<(), DriverError> {
        if self.client.is_none() {
            let endpoint = if self.run_cfg.simulate {
                if self.sim.is_none() {
                    self.sim = Some(SimBoard::spawn().map_err(|e| DriverError::Io {
                        board: self.cfg.board_name.clone(),
                        source: e,
                    })?);
                }
                self.sim.as_ref().map(|s| s.endpoint()).unwrap_or_default()
            } else {
                self.cfg.endpoint.clone()
            };
            self.client = Some(BoardClient::new(&self.cfg.board_name, &endpoint));
        }
        let client = self.client.as_mut().unwrap();
        if client.state() == BoardState::Closed {
            client.connect()?;
            client.open()?;
            client.reset()?;
        }
        Ok(())
    }

    fn client(&mut self) -> &mut BoardClient {
        self.client.as_mut().expect("ensure_connected establishes the client first")
    }

    /// Immediately outputs a block of words in manual mode. Retries once over
    /// a fresh connection if the board dropped the link in between.
    pub fn program_manual(&mut self, words: &[u32]) -> Result<(), DriverError> {
        self.ensure_connected()?;
        match self.program_manual_once(words) {
            Err(DriverError::Io { .. }) => {
                self.client().reconnect()?;
                self.program_manual_once(words)
            }
            other => other,
        }
    }

    fn program_manual_once(&mut self, words: &[u32]) -> Result<(), DriverError> {
        let mut cfg = self.run_cfg.config_packet();
        // Manual words run as a single immediate pass, no rendezvous hold
        cfg.cycles = 1;
        cfg.control &= !(CTRL_AUTO_SYNC_EN | CTRL_AUTO_SYNC_PRIM);
        cfg.sync_wait = crate::protocol::SYNC_WAIT_SINGLE;
        cfg.sync_phase = crate::protocol::SYNC_PHASE_NONE;
        let client = self.client();
        if client.state() == BoardState::Running {
            client.stop()?;
        }
        client.configure(&cfg)?;
        client.write_samples(words)?;
        client.start()?;
        Ok(())
    }

    /// Loads a compiled shot and arms the board for a buffered run. Returns
    /// the values every channel holds once the run completes.
    ///
    /// `fresh` forces re-programming even if the shot matches the cached run.
    pub fn transition_to_buffered(
        &mut self,
        shot_path: &str,
        fresh: bool,
    ) -> Result<IndexMap<String, f64>, DriverError> {
        let shot = ShotFile::load(shot_path)?;
        let board = self.cfg.board_name.clone();
        let matrix = shot.board_matrix(&board)?;
        let stored_crcs = shot.board_crcs(&board)?;
        let computed = matrix_crc(&matrix);
        if stored_crcs.first() != Some(&computed) {
            return Err(DriverError::CrcMismatch {
                board,
                stored: stored_crcs.first().copied().unwrap_or(0),
                computed,
            });
        }

        let args = shot.worker_args(&self.cfg.board_name).unwrap_or(Value::Null);
        let mut run_cfg = self.cfg.clone();
        run_cfg
            .apply_args(&args)
            .map_err(|e| self.err_run(format!("bad worker_args_ex: {}", e)))?;
        self.run_cfg = run_cfg;

        let cache_key = RunCache {
            identity: shot.run_identity(),
            matrix_crc: computed,
            args_fingerprint: args.to_string(),
        };
        let cache_hit = !fresh && self.cache.as_ref() == Some(&cache_key);
        self.expected_samples = matrix.nrows() as u32;
        self.expected_time = matrix[[matrix.nrows() - 1, 0]];
        self.last_report = None;

        let init_words: Option<Vec<u32>> = shot
            .board_init(&board)?
            .map(|init| init.iter().copied().collect());

        self.ensure_connected()?;
        let packet = self.run_cfg.config_packet();
        let words: Vec<u32> = matrix.iter().copied().collect();
        let payload = json!({ "board": self.cfg.board_name, "crc": computed });
        let armed = json!({ "board": self.cfg.board_name, "armed": true });

        if self.run_cfg.is_primary {
            if cache_hit {
                log::info!("board '{}': run cache hit, skipping upload", self.cfg.board_name);
            } else {
                if let Some(init) = &init_words {
                    self.run_init_block(init)?;
                }
                self.client().configure(&packet)?;
                self.client().write_samples(&words)?;
            }
            if self.run_cfg.multi_board() {
                self.rendezvous(&payload, fresh)?;
            }
            self.client().start()?;
            if self.run_cfg.multi_board() {
                self.rendezvous(&armed, false)?;
            }
        } else {
            // Secondaries rendezvous before arming: a missing peer is caught
            // while nothing is running yet
            self.rendezvous(&payload, fresh)?;
            if cache_hit {
                log::info!("board '{}': run cache hit, skipping upload", self.cfg.board_name);
            } else {
                if let Some(init) = &init_words {
                    self.run_init_block(init)?;
                }
                self.client().configure(&packet)?;
                self.client().write_samples(&words)?;
            }
            self.client().start()?;
            // Report back so the primary knows every secondary is armed
            self.rendezvous(&armed, false)?;
        }
        self.cache = Some(cache_key);
        log::info!(
            "board '{}': armed for run {} ({} samples)",
            self.cfg.board_name,
            shot.run_identity(),
            self.expected_samples
        );
        shot.board_final_values(&board).map_err(DriverError::from)
    }

    /// Runs a stored device-init block once, before the first upload of user
    /// data. The block is short, so it is supervised with a tight deadline.
    fn run_init_block(&mut self, words: &[u32]) -> Result<(), DriverError> {
        log::info!("board '{}': running device init ({} words)", self.cfg.board_name, words.len());
        let mut cfg = self.run_cfg.config_packet();
        cfg.cycles = 1;
        cfg.control &= !(CTRL_AUTO_SYNC_EN | CTRL_AUTO_SYNC_PRIM);
        cfg.sync_wait = crate::protocol::SYNC_WAIT_SINGLE;
        cfg.sync_phase = crate::protocol::SYNC_PHASE_NONE;
        self.client().configure(&cfg)?;
        self.client().write_samples(words)?;
        self.client().start()?;
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let status = self.client().status()?;
            if status.is_end() {
                return Ok(());
            }
            if Instant::now() > deadline {
                self.abort_run()?;
                return Err(self.err_run("device init did not finish"));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Connects the sync link to the configured cross-process hub server,
    /// once. Without `sync_server` the link keeps its in-process hub.
    fn ensure_sync_bus(&mut self) -> Result<(), DriverError> {
        if self.sync_remote {
            return Ok(());
        }
        if let Some(endpoint) = self.run_cfg.sync_server.clone() {
            let hub = RemoteHub::connect(&endpoint).map_err(|e| DriverError::SyncFailed {
                board: self.cfg.board_name.clone(),
                reason: format!("cannot reach sync server {}: {}", endpoint, e),
            })?;
            self.sync.set_bus(Box::new(hub));
            self.sync_remote = true;
        }
        Ok(())
    }

    fn rendezvous(&mut self, payload: &Value, fresh: bool) -> Result<(), DriverError> {
        self.ensure_sync_bus()?;
        let reset = fresh || self.sync_pending_reset;
        let result = self.sync.sync_boards(payload, reset);
        log::debug!(
            "board '{}': sync {:?} in {:?}",
            self.cfg.board_name,
            result.status,
            result.duration
        );
        match result.status {
            SyncStatus::Ok => {
                self.sync_pending_reset = false;
                Ok(())
            }
            SyncStatus::Timeout | SyncStatus::TimeoutOther => {
                // Next round must restart the counters or the peers stay
                // permanently out of step
                self.sync_pending_reset = true;
                Err(DriverError::SyncFailed {
                    board: self.cfg.board_name.clone(),
                    reason: format!("{:?} after {:?}", result.status, result.duration),
                })
            }
        }
    }

    /// Supervises the running board until it finishes, fails or the deadline
    /// passes. Ignorable clock-loss reports are counted as warnings.
    pub fn wait_until_done(&mut self, timeout: Duration) -> Result<RunReport, DriverError> {
        let deadline = Instant::now() + timeout;
        let mut warnings = 0u32;
        loop {
            let status = self.client().status()?;
            let outcome = interpret_status(
                status,
                self.expected_samples,
                self.expected_time,
                self.run_cfg.ignore_clock_loss,
            );
            match outcome {
                RunInterpretation::Finished => {
                    return Ok(self.finish_run(RunReport { outcome, warnings, status }));
                }
                RunInterpretation::ClockLost { fatal: false } => {
                    warnings += 1;
                }
                RunInterpretation::EndMismatch {
                    got_samples,
                    expected_samples,
                    got_time,
                    expected_time,
                } => {
                    log::error!(
                        "board '{}': run ended after {} of {} samples at board time {} (expected {})",
                        self.cfg.board_name, got_samples, expected_samples, got_time, expected_time
                    );
                    self.abort_run()?;
                    return Ok(self.finish_run(RunReport { outcome, warnings, status }));
                }
                RunInterpretation::Fatal | RunInterpretation::ClockLost { fatal: true } => {
                    log::error!("board '{}': aborting run ({:?})", self.cfg.board_name, outcome);
                    self.abort_run()?;
                    return Ok(self.finish_run(RunReport { outcome, warnings, status }));
                }
                RunInterpretation::Running
                | RunInterpretation::ExternalStartWait
                | RunInterpretation::RestartWait => {}
            }
            if Instant::now() > deadline {
                self.abort_run()?;
                return Err(self.err_run(format!("no end of run within {:?}", timeout)));
            }
            std::thread::sleep(Duration::from_millis(UPDATE_TIME_MS));
        }
    }

    fn finish_run(&mut self, report: RunReport) -> RunReport {
        self.last_report = Some(report.clone());
        report
    }

    /// Stops the board if it is still armed or running.
    pub fn abort_run(&mut self) -> Result<(), DriverError> {
        let client = self.client();
        if matches!(client.state(), BoardState::Running | BoardState::Armed) {
            client.stop()?;
        }
        Ok(())
    }

    /// Returns the board to manual mode after a buffered run.
    ///
    /// Secondaries additionally re-configure with single-board sync settings,
    /// releasing the rendezvous hold so manual words execute immediately. In
    /// a multi-board run all boards then exchange their cycle status in one
    /// closing rendezvous; a dead peer only logs, it must not wedge the
    /// return to manual.
    pub fn transition_to_manual(&mut self, abort: bool) -> Result<(), DriverError> {
        if abort {
            self.abort_run()?;
        }
        if !self.run_cfg.is_primary {
            let base = self.run_cfg.config_packet();
            let client = self.client();
            if client.state() == BoardState::Running {
                client.stop()?;
            }
            client.unlock(&base)?;
        }
        if self.run_cfg.multi_board() {
            let payload = match &self.last_report {
                Some(report) => json!({
                    "board": self.cfg.board_name,
                    "outcome": format!("{:?}", report.outcome),
                    "warnings": report.warnings,
                    "board_time": report.status.board_time,
                    "board_samples": report.status.board_samples,
                }),
                None => json!({ "board": self.cfg.board_name }),
            };
            self.ensure_sync_bus()?;
            let result = self.sync.sync_boards(&payload, self.sync_pending_reset);
            match result.status {
                SyncStatus::Ok => {
                    self.sync_pending_reset = false;
                    self.cycle_status = result.payloads;
                }
                SyncStatus::Timeout | SyncStatus::TimeoutOther => {
                    self.sync_pending_reset = true;
                    log::warn!(
                        "board '{}': end-of-cycle status exchange failed ({:?})",
                        self.cfg.board_name,
                        result.status
                    );
                }
            }
        }
        self.run_cfg = self.cfg.clone();
        Ok(())
    }

    /// Closes the connection and tears down the simulated board, if any.
    pub fn shutdown(&mut self) -> Result<(), DriverError> {
        if let Some(client) = self.client.as_mut() {
            client.close()?;
        }
        self.client = None;
        self.sim = None;
        Ok(())
    }
}

// ---- worker thread ---------------------------------------------------------

#[derive(Debug)]
pub enum WorkerCmd {
    ProgramManual(Vec<u32>),
    TransitionToBuffered { shot_path: PathBuf, fresh: bool },
    WaitUntilDone { timeout: Duration },
    TransitionToManual { abort: bool },
    Status,
    Shutdown,
}

#[derive(Debug)]
pub enum WorkerRsp {
    Ok,
    /// Final channel values of the shot just armed.
    Finals(IndexMap<String, f64>),
    Status(BoardStatus),
    Report(RunReport),
    Err(String),
}

/// Drives one worker from a command channel until `Shutdown`.
pub fn run_worker(mut worker: BoardWorker, rx: Receiver<WorkerCmd>, tx: Sender<WorkerRsp>) {
    fn send(tx: &Sender<WorkerRsp>, board: &str, rsp: WorkerRsp) {
        if tx.send(rsp).is_err() {
            log::error!("worker '{}': response channel closed", board);
        }
    }
    for cmd in rx.iter() {
        let rsp = match cmd {
            WorkerCmd::ProgramManual(words) => match worker.program_manual(&words) {
                Ok(()) => WorkerRsp::Ok,
                Err(e) => WorkerRsp::Err(e.to_string()),
            },
            WorkerCmd::TransitionToBuffered { shot_path, fresh } => {
                match worker.transition_to_buffered(&shot_path.to_string_lossy(), fresh) {
                    Ok(finals) => WorkerRsp::Finals(finals),
                    Err(e) => WorkerRsp::Err(e.to_string()),
                }
            }
            WorkerCmd::WaitUntilDone { timeout } => match worker.wait_until_done(timeout) {
                Ok(report) => WorkerRsp::Report(report),
                Err(e) => WorkerRsp::Err(e.to_string()),
            },
            WorkerCmd::TransitionToManual { abort } => {
                match worker.transition_to_manual(abort) {
                    Ok(()) => WorkerRsp::Ok,
                    Err(e) => WorkerRsp::Err(e.to_string()),
                }
            }
            WorkerCmd::Status => match worker.ensure_connected().and_then(|_| worker.client().status()) {
                Ok(status) => WorkerRsp::Status(status),
                Err(e) => WorkerRsp::Err(e.to_string()),
            },
            WorkerCmd::Shutdown => {
                let rsp = match worker.shutdown() {
                    Ok(()) => WorkerRsp::Ok,
                    Err(e) => WorkerRsp::Err(e.to_string()),
                };
                send(&tx, worker.board_name(), rsp);
                break;
            }
        };
        send(&tx, worker.board_name(), rsp);
    }
}
