//! End-to-end runtime tests: compile a shot with the compiler backend, then
//! run it against simulated boards through the full worker path.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use serde_json::json;

use fpgacompiler_backend::graph::{Experiment, TriggerMode};
use fpgacompiler_backend::matrix::build;
use fpgacompiler_backend::shot::ShotFile;

use fpgactrl_backend::driver::RunInterpretation;
use fpgactrl_backend::sync::EventHub;
use fpgactrl_backend::worker::{run_worker, BoardWorker, WorkerCmd, WorkerConfig, WorkerRsp};

fn worker_config(board: &str, is_primary: bool, secondaries: Vec<String>) -> WorkerConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    WorkerConfig {
        board_name: board.to_string(),
        endpoint: "127.0.0.1:0".to_string(),
        num_racks: 1,
        bus_rate: 1e6,
        is_primary,
        secondaries,
        inputs: Default::default(),
        outputs: Default::default(),
        ext_clock: false,
        ignore_clock_loss: false,
        sync_wait: 0,
        sync_phase: 0,
        sync_server: None,
        cycles: 1,
        simulate: true,
        strb_delay: 0,
    }
}

/// Compiles a one-board shot and writes it to a temp file.
fn single_board_shot(dir: &tempfile::TempDir, with_wait: bool) -> String {
    let mut exp = Experiment::new();
    exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
    exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
    exp.go_high("d0", 0.0).unwrap();
    exp.go_low("d0", 5e-6).unwrap();
    if with_wait {
        exp.wait("primary", 2e-6).unwrap();
    }
    exp.stop("primary", 10e-6).unwrap();
    let out = build(&exp, "primary").unwrap();

    let mut shot = ShotFile::new();
    shot.set_sequence("20260828T110000_seq", 0, 1);
    shot.write_board("primary", &out, &json!({})).unwrap();
    let path = dir.path().join("shot.h5b");
    shot.save(&path).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn buffered_run_completes_against_the_sim() {
    let dir = tempfile::tempdir().unwrap();
    let path = single_board_shot(&dir, false);

    let mut worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    let finals = worker.transition_to_buffered(&path, false).unwrap();
    assert_eq!(finals["d0"], 0.0); // the last edge drives the line low
    let report = worker.wait_until_done(Duration::from_secs(2)).unwrap();
    assert_eq!(report.outcome, RunInterpretation::Finished);
    assert_eq!(report.warnings, 0);
    worker.transition_to_manual(false).unwrap();
    worker.shutdown().unwrap();
}

#[test]
fn identical_shot_hits_the_run_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = single_board_shot(&dir, false);

    let mut worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    worker.transition_to_buffered(&path, false).unwrap();
    worker.wait_until_done(Duration::from_secs(2)).unwrap();
    worker.transition_to_manual(false).unwrap();

    // Same identity, CRC and args: the second transition skips the upload and
    // restarts the retained matrix
    worker.transition_to_buffered(&path, false).unwrap();
    let report = worker.wait_until_done(Duration::from_secs(2)).unwrap();
    assert_eq!(report.outcome, RunInterpretation::Finished);

    // fresh = true forces a full re-program and still completes
    worker.transition_to_buffered(&path, true).unwrap();
    let report = worker.wait_until_done(Duration::from_secs(2)).unwrap();
    assert_eq!(report.outcome, RunInterpretation::Finished);
    worker.shutdown().unwrap();
}

#[test]
fn wait_marker_parks_the_run_until_the_restart_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let path = single_board_shot(&dir, true);

    let mut worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    worker.transition_to_buffered(&path, false).unwrap();
    let sim = worker.sim_handle().expect("simulate config spawns a sim board");

    // The board sits at the stop marker, still running and waiting
    let parked = sim.status();
    assert_ne!(parked.status & fpgacompiler_backend::words::STATUS_WAIT, 0);
    assert_ne!(parked.status & fpgacompiler_backend::words::STATUS_RUN, 0);
    assert_eq!(parked.board_time, 2);

    let supervisor = thread::spawn(move || {
        let report = worker.wait_until_done(Duration::from_secs(5)).unwrap();
        (worker, report)
    });
    thread::sleep(Duration::from_millis(300));
    sim.fire_restart_trigger();
    let (mut worker, report) = supervisor.join().unwrap();
    assert_eq!(report.outcome, RunInterpretation::Finished);
    assert_eq!(report.status.board_time, 10);
    worker.shutdown().unwrap();
}

#[test]
fn manual_words_execute_immediately() {
    let mut exp = Experiment::new();
    exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
    exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
    exp.go_high("d0", 0.0).unwrap();
    exp.stop("primary", 3e-6).unwrap();
    let out = build(&exp, "primary").unwrap();
    let words: Vec<u32> = out.matrix.iter().copied().collect();

    let mut worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    worker.program_manual(&words).unwrap();
    // The sim executes the block in place; no stop marker short of the end
    let status = worker.sim_handle().unwrap().status();
    assert_ne!(status.status & fpgacompiler_backend::words::STATUS_END, 0);
    assert_eq!(status.board_time, 3);
    worker.shutdown().unwrap();
}

#[test]
fn dds_shot_runs_the_device_init_block_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut exp = Experiment::new();
    exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
    exp.add_dds("primary", "dds0", "0x10", 0, fpgacompiler_backend::encoder::DdsVariant::Ad9854)
        .unwrap();
    exp.set_freq("dds0", 0.0, 10e6, true).unwrap();
    exp.stop("primary", 20e-6).unwrap();
    let out = build(&exp, "primary").unwrap();
    assert!(out.init.nrows() > 0);

    let mut shot = ShotFile::new();
    shot.set_sequence("20260828T120000_dds", 0, 0);
    shot.write_board("primary", &out, &json!({})).unwrap();
    let path = dir.path().join("dds.h5b");
    shot.save(&path).unwrap();

    let mut worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    let finals = worker.transition_to_buffered(&path.to_string_lossy(), false).unwrap();
    assert!((finals["dds0.freq"] - 10e6).abs() < 1.0);
    let report = worker.wait_until_done(Duration::from_secs(2)).unwrap();
    assert_eq!(report.outcome, RunInterpretation::Finished);
    assert_eq!(report.status.board_time, 20);
    worker.shutdown().unwrap();
}

#[test]
fn worker_thread_runs_a_shot_over_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = single_board_shot(&dir, false);

    let worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    let (cmd_tx, cmd_rx) = channel::unbounded();
    let (rsp_tx, rsp_rx) = channel::unbounded();
    let thread = thread::spawn(move || run_worker(worker, cmd_rx, rsp_tx));

    cmd_tx
        .send(WorkerCmd::TransitionToBuffered { shot_path: PathBuf::from(&path), fresh: false })
        .unwrap();
    match rsp_rx.recv().unwrap() {
        WorkerRsp::Finals(finals) => assert_eq!(finals["d0"], 0.0),
        other => panic!("unexpected response {:?}", other),
    }

    cmd_tx.send(WorkerCmd::WaitUntilDone { timeout: Duration::from_secs(2) }).unwrap();
    match rsp_rx.recv().unwrap() {
        WorkerRsp::Report(report) => assert_eq!(report.outcome, RunInterpretation::Finished),
        other => panic!("unexpected response {:?}", other),
    }

    cmd_tx.send(WorkerCmd::TransitionToManual { abort: false }).unwrap();
    assert!(matches!(rsp_rx.recv().unwrap(), WorkerRsp::Ok));

    cmd_tx.send(WorkerCmd::Status).unwrap();
    match rsp_rx.recv().unwrap() {
        WorkerRsp::Status(status) => assert!(status.is_end()),
        other => panic!("unexpected response {:?}", other),
    }

    cmd_tx.send(WorkerCmd::Shutdown).unwrap();
    assert!(matches!(rsp_rx.recv().unwrap(), WorkerRsp::Ok));
    thread.join().unwrap();
}

/// Compiles a two-board shot (software-triggered secondary).
fn two_board_shot(dir: &tempfile::TempDir) -> String {
    let mut exp = Experiment::new();
    exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
    exp.add_secondary_board("secondary", "192.168.1.131:49701", 1, 1e6, "primary", TriggerMode::Software)
        .unwrap();
    exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
    exp.add_digital_out("secondary", "d1", "0x0/0x0", 0).unwrap();
    exp.go_high("d0", 0.0).unwrap();
    exp.go_high("d1", 0.0).unwrap();
    exp.stop("primary", 5e-6).unwrap();
    exp.stop("secondary", 5e-6).unwrap();

    let mut shot = ShotFile::new();
    shot.set_sequence("20260828T113000_pair", 0, 0);
    for board in ["primary", "secondary"] {
        let out = build(&exp, board).unwrap();
        shot.write_board(board, &out, &json!({})).unwrap();
    }
    let path = dir.path().join("pair.h5b");
    shot.save(&path).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn two_boards_rendezvous_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_board_shot(&dir);
    let hub = EventHub::new();

    let mut primary = BoardWorker::new(
        worker_config("primary", true, vec!["secondary".to_string()]),
        hub.clone(),
    );
    let mut secondary = BoardWorker::new(worker_config("secondary", false, vec![]), hub);

    let sec_path = path.clone();
    let sec_thread = thread::spawn(move || {
        let result = secondary.transition_to_buffered(&sec_path, false);
        (secondary, result)
    });
    primary.transition_to_buffered(&path, false).unwrap();
    let (mut secondary, sec_result) = sec_thread.join().unwrap();
    sec_result.unwrap();

    let p = primary.wait_until_done(Duration::from_secs(2)).unwrap();
    let s = secondary.wait_until_done(Duration::from_secs(2)).unwrap();
    assert_eq!(p.outcome, RunInterpretation::Finished);
    assert_eq!(s.outcome, RunInterpretation::Finished);

    // Back to manual: both sides meet in the closing status exchange, the
    // secondary releasing its rendezvous hold first
    let sec_thread = thread::spawn(move || {
        secondary.transition_to_manual(false).unwrap();
        secondary
    });
    primary.transition_to_manual(false).unwrap();
    let mut secondary = sec_thread.join().unwrap();

    // Each side now holds the peer's end-of-cycle status
    assert_eq!(primary.cycle_status()["secondary"]["board_samples"], 2);
    assert_eq!(primary.cycle_status()["secondary"]["board_time"], 5);
    assert_eq!(secondary.cycle_status()["primary"]["board_time"], 5);
    assert_eq!(secondary.cycle_status()["primary"]["outcome"], "Finished");

    secondary.shutdown().unwrap();
    primary.shutdown().unwrap();
}

#[test]
fn missing_secondary_fails_the_sync_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_board_shot(&dir);
    let hub = EventHub::new();

    let mut primary = BoardWorker::new(
        worker_config("primary", true, vec!["secondary".to_string()]),
        hub.clone(),
    );
    primary.set_sync_timeout(Duration::from_millis(200));

    // Round 1: the secondary worker does not exist yet
    let err = primary.transition_to_buffered(&path, false).unwrap_err();
    assert!(err.to_string().contains("synchronization failed"));

    // Recovery: bring up the secondary and retry with fresh counters
    let mut secondary = BoardWorker::new(worker_config("secondary", false, vec![]), hub);
    secondary.set_sync_timeout(Duration::from_secs(2));
    primary.set_sync_timeout(Duration::from_secs(2));
    let sec_path = path.clone();
    let sec_thread = thread::spawn(move || {
        // Let the primary reset its counters first
        thread::sleep(Duration::from_millis(50));
        let result = secondary.transition_to_buffered(&sec_path, true);
        (secondary, result)
    });
    primary.transition_to_buffered(&path, true).unwrap();
    let (mut secondary, sec_result) = sec_thread.join().unwrap();
    sec_result.unwrap();

    assert_eq!(
        primary.wait_until_done(Duration::from_secs(2)).unwrap().outcome,
        RunInterpretation::Finished
    );
    secondary.shutdown().unwrap();
    primary.shutdown().unwrap();
}

#[test]
fn workers_rendezvous_through_a_sync_server() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_board_shot(&dir);

    // Each worker keeps its own hub and reaches the shared one over TCP,
    // the way workers in separate processes would
    let server = fpgactrl_backend::sync::HubServer::bind("127.0.0.1:0", EventHub::new()).unwrap();
    let endpoint = server.endpoint();

    let mut primary_cfg = worker_config("primary", true, vec!["secondary".to_string()]);
    primary_cfg.sync_server = Some(endpoint.clone());
    let mut secondary_cfg = worker_config("secondary", false, vec![]);
    secondary_cfg.sync_server = Some(endpoint);

    let mut primary = BoardWorker::new(primary_cfg, EventHub::new());
    let mut secondary = BoardWorker::new(secondary_cfg, EventHub::new());

    let sec_path = path.clone();
    let sec_thread = thread::spawn(move || {
        let result = secondary.transition_to_buffered(&sec_path, false);
        (secondary, result)
    });
    primary.transition_to_buffered(&path, false).unwrap();
    let (mut secondary, sec_result) = sec_thread.join().unwrap();
    sec_result.unwrap();

    let p = primary.wait_until_done(Duration::from_secs(2)).unwrap();
    let s = secondary.wait_until_done(Duration::from_secs(2)).unwrap();
    assert_eq!(p.outcome, RunInterpretation::Finished);
    assert_eq!(s.outcome, RunInterpretation::Finished);

    let sec_thread = thread::spawn(move || {
        secondary.transition_to_manual(false).unwrap();
        secondary
    });
    primary.transition_to_manual(false).unwrap();
    let mut secondary = sec_thread.join().unwrap();
    assert_eq!(primary.cycle_status()["secondary"]["board_time"], 5);

    secondary.shutdown().unwrap();
    primary.shutdown().unwrap();
}

#[test]
fn tampered_shot_fails_the_crc_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = single_board_shot(&dir, false);

    // Corrupt one matrix word behind the stored CRC's back
    let mut shot = ShotFile::load(&path).unwrap();
    let mut matrix = shot.board_matrix("primary").unwrap();
    matrix[[0, 1]] ^= 1;
    shot.write_matrix("devices/primary", "primary_matrix", &matrix);
    shot.save(&path).unwrap();

    let mut worker = BoardWorker::new(worker_config("primary", true, vec![]), EventHub::new());
    let err = worker.transition_to_buffered(&path, false).unwrap_err();
    assert!(err.to_string().contains("CRC"));
}
