//! Sample-matrix builder.
//!
//! Compiles one board's channel instruction lists into the `(tick, rack
//! words)` matrix streamed to the hardware. The build runs in three passes:
//!
//! 1. Per intermediate device, expand instructions into timed bus words.
//!    The IM's address kind decides the merge rule: `Single` channels own
//!    their address and get plain change detection, `Merged` digital lines
//!    are OR-combined into one port word, `Multiple` DDS programmings expand
//!    into register bursts over consecutive samples.
//! 2. Union all emission ticks (plus tick 0, wait markers and the stop time)
//!    into the row axis and place every word, collecting conflicts instead
//!    of failing on the first one.
//! 3. Compact unchanged rows, apply strobe alternation per rack and OR the
//!    control bits in.
//!
//! Any conflict aborts the build with the full [`ConflictTable`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crc::{Crc, CRC_32_ISO_HDLC};
use indexmap::IndexMap;
use ndarray::Array2;

use crate::encoder::{combine_digital, AddrKind, DdsSub, DdsVariant, DeviceModel, DDS_MIN_TIME_STEP};
use crate::errors::{CompileError, ConflictRow, ConflictTable};
use crate::graph::{BoardId, ChannelInstr, Experiment, ImId};
use crate::words::{pack, BIT_NOP, BIT_STOP, BIT_STRB};

/// Checksum over the compiled words, cross-checked by the worker before a run.
pub const MATRIX_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Output of one board compilation.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// One row per retained sample; column 0 is the bus tick, then one word
    /// column per rack.
    pub matrix: Array2<u32>,
    /// Device-init block, same column layout as `matrix`. Runs once before
    /// the first upload of user data; empty when the board carries no device
    /// that needs an init burst.
    pub init: Array2<u32>,
    /// Value every channel holds after the run, in base hardware units
    /// (volts, levels as 0/1, Hz/dBm/degrees). DDS entries are keyed
    /// `"<channel>.<freq|amp|phase>"`; a programming the device could not
    /// represent leaves the variant's invalid-value sentinel.
    pub final_values: IndexMap<String, f64>,
    /// CRC-32 per channel over its device address followed by every word the
    /// channel contributed, in emission order. Keyed by channel name.
    pub crcs: IndexMap<String, u32>,
}

/// One bus word scheduled onto a `(tick, rack)` slot.
#[derive(Debug, Clone)]
struct Emission {
    tick: u64,
    rack: u8,
    word: u32,
    channel: String,
    address: u8,
}

/// Expands one channel's analog instruction list into `(tick, volts)` points.
///
/// Ramp points falling at or past the next instruction's start tick are cut;
/// the later instruction wins the slot.
fn analog_points(
    chan: &crate::graph::Channel,
    bus_rate: f64,
) -> Result<Vec<(u64, f64)>, CompileError> {
    let starts: Vec<u64> = chan.instr_list.keys().copied().collect();
    let mut points: Vec<(u64, f64)> = Vec::new();
    for (idx, (&start_tick, instr)) in chan.instr_list.iter().enumerate() {
        let instr = match instr {
            ChannelInstr::Analog(i) => i,
            other => panic!(
                "channel {} carries a non-analog instruction {:?} on an analog device",
                chan.name, other
            ),
        };
        let next_start = starts.get(idx + 1).copied().unwrap_or(u64::MAX);
        let t_user = start_tick as f64 / bus_rate;
        for (t, value) in instr.expand(t_user) {
            let tick = (t * bus_rate).round() as u64;
            if tick >= next_start && tick != start_tick {
                break;
            }
            let volts = match &chan.conversion {
                Some(conv) => conv.to_base(value)?,
                None => value,
            };
            points.push((tick, volts));
        }
    }
    points.sort_by_key(|&(tick, _)| tick);
    Ok(points)
}

struct Builder<'a> {
    exp: &'a Experiment,
    board: BoardId,
    bus_rate: f64,
    num_racks: usize,
    emissions: Vec<Emission>,
    final_values: IndexMap<String, f64>,
    /// Sample ticks with strobe toggling suppressed, per rack.
    no_strb: Vec<BTreeSet<u64>>,
    /// Ticks of skipped programmings, still transmitted as no-op samples.
    placeholders: BTreeSet<u64>,
}

impl<'a> Builder<'a> {
    fn new(exp: &'a Experiment, board: BoardId) -> Self {
        let b = exp.board(board);
        Self {
            exp,
            board,
            bus_rate: b.bus_rate,
            num_racks: b.num_racks as usize,
            emissions: Vec::new(),
            final_values: IndexMap::new(),
            no_strb: vec![BTreeSet::new(); b.num_racks as usize],
            placeholders: BTreeSet::new(),
        }
    }

    fn emit(&mut self, tick: u64, rack: u8, word: u32, channel: &str, address: u8) {
        self.emissions.push(Emission { tick, rack, word, channel: channel.to_string(), address });
    }

    fn merge_single(&mut self, im_id: ImId) -> Result<(), CompileError> {
        let im = self.exp.im(im_id);
        let dac = match im.model {
            DeviceModel::Dac(v) => v,
            _ => unreachable!("single-address IMs are analog"),
        };
        for &chan_id in &im.channels {
            let chan = self.exp.channel(chan_id);
            let mut prev_word: Option<u32> = None;
            let mut last_value = 0.0;
            for (tick, volts) in analog_points(chan, self.bus_rate)? {
                let word = dac.encode(im.address, volts);
                // Re-programming the same code is dropped, the channel holds
                if prev_word == Some(word) {
                    continue;
                }
                prev_word = Some(word);
                last_value = dac.from_code(dac.to_code(volts));
                self.emit(tick, chan.rack, word, &chan.name, im.address);
            }
            if prev_word.is_some() {
                self.final_values.insert(chan.name.clone(), last_value);
            }
        }
        Ok(())
    }

    fn merge_merged(&mut self, im_id: ImId) {
        let im = self.exp.im(im_id);
        // tick -> line changes requested by any channel of the port
        let mut changes: BTreeMap<u64, Vec<(u8, bool, String)>> = BTreeMap::new();
        for &chan_id in &im.channels {
            let chan = self.exp.channel(chan_id);
            for (&tick, instr) in &chan.instr_list {
                let level = match instr {
                    ChannelInstr::Digital(level) => *level,
                    other => panic!(
                        "channel {} carries a non-digital instruction {:?} on a digital port",
                        chan.name, other
                    ),
                };
                changes.entry(tick).or_default().push((chan.channel_bit, level, chan.name.clone()));
            }
        }
        let mut levels: HashMap<u8, bool> = HashMap::new();
        let mut prev_combined: Option<u32> = None;
        let rack = im.rack;
        for (tick, line_changes) in changes {
            let who = line_changes[0].2.clone();
            for (bit, level, _) in line_changes {
                levels.insert(bit, level);
            }
            let bits: Vec<(u8, bool)> = levels.iter().map(|(&b, &l)| (b, l)).collect();
            let combined = combine_digital(&bits);
            if prev_combined == Some(combined) {
                continue;
            }
            prev_combined = Some(combined);
            self.emit(tick, rack, pack(im.address, combined), &who, im.address);
        }
        for &chan_id in &im.channels {
            let chan = self.exp.channel(chan_id);
            if let Some((_, last)) = chan
                .instr_list
                .iter()
                .filter_map(|(t, i)| match i {
                    ChannelInstr::Digital(level) => Some((t, *level)),
                    _ => None,
                })
                .last()
            {
                self.final_values.insert(chan.name.clone(), last as u8 as f64);
            }
        }
    }

    /// Sample spacing of a DDS register burst, at least one bus tick.
    fn burst_spacing(&self) -> u64 {
        ((DDS_MIN_TIME_STEP * self.bus_rate).round() as u64).max(1)
    }

    fn merge_multiple(&mut self, im_id: ImId) -> Result<(), CompileError> {
        let im = self.exp.im(im_id);
        let dds = match im.model {
            DeviceModel::Dds(v) => v,
            _ => unreachable!("multiple-address IMs are DDS"),
        };
        let spacing = self.burst_spacing();
        for &chan_id in &im.channels {
            let chan = self.exp.channel(chan_id);
            let mut last: HashMap<DdsSub, f64> = HashMap::new();
            let mut prev_start: Option<u64> = None;
            for (&tick, instr) in &chan.instr_list {
                let (sub, value, update) = match instr {
                    ChannelInstr::Dds { sub, value, update } => (*sub, *value, *update),
                    other => panic!(
                        "channel {} carries a non-DDS instruction {:?} on a DDS device",
                        chan.name, other
                    ),
                };
                // Start ticks of successive programmings must stay at least
                // one device time step apart, or the register bytes of the
                // two bursts interleave on the bus.
                if let Some(prev) = prev_start {
                    if tick - prev < spacing {
                        return Err(CompileError::DdsTooClose {
                            channel: chan.name.clone(),
                            prev: prev as f64 / self.bus_rate,
                            time: tick as f64 / self.bus_rate,
                            min_step: DDS_MIN_TIME_STEP,
                        });
                    }
                }
                prev_start = Some(tick);
                match dds.encode(im.address, sub, value, update) {
                    Some(words) => {
                        for (i, word) in words.into_iter().enumerate() {
                            self.emit(tick + i as u64 * spacing, chan.rack, word, &chan.name, im.address);
                        }
                        let quantized = dds.value_of_word(
                            sub,
                            dds.tuning_word(sub, value).unwrap_or(0),
                        );
                        last.insert(sub, quantized);
                    }
                    None => {
                        log::warn!(
                            "channel {}: {} value {} not representable on {:?}, sample sent as no-op",
                            chan.name,
                            sub,
                            value,
                            dds
                        );
                        last.insert(sub, DdsVariant::invalid_value(sub));
                        self.placeholders.insert(tick);
                    }
                }
            }
            for (sub, value) in last {
                self.final_values.insert(format!("{}.{}", chan.name, sub), value);
            }
        }
        Ok(())
    }

    fn collect(&mut self) -> Result<(), CompileError> {
        for im_id in self.exp.board_im_ids(self.board) {
            let im = self.exp.im(im_id);
            match im.hardware_type().addr {
                AddrKind::Single => self.merge_single(im_id)?,
                AddrKind::Merged => self.merge_merged(im_id),
                AddrKind::Multiple => self.merge_multiple(im_id)?,
            }
            for &chan_id in &self.exp.im(im_id).channels {
                let chan = self.exp.channel(chan_id);
                for &tick in &chan.no_strb_ticks {
                    self.no_strb[chan.rack as usize].insert(tick);
                }
            }
        }
        Ok(())
    }
}

/// Compiles the sample matrix for one board of the experiment.
pub fn build(exp: &Experiment, board_name: &str) -> Result<BuildResult, CompileError> {
    let mut timer = crate::utils::TickTimer::new();
    let board_id = exp.board_id(board_name)?;
    let board = exp.board(board_id);
    let mut builder = Builder::new(exp, board_id);
    builder.collect()?;

    // Row axis: every emission tick, plus tick 0 (the board always executes
    // a first sample), skipped-programming placeholders, wait markers and
    // the declared stop time.
    let mut ticks: BTreeSet<u64> = builder.emissions.iter().map(|e| e.tick).collect();
    ticks.insert(0);
    for &tick in &builder.placeholders {
        ticks.insert(tick);
    }
    for &tick in &board.wait_ticks {
        ticks.insert(tick);
    }
    let stop_tick = match board.stop_time {
        Some(t) => {
            let tick = (t * board.bus_rate).round() as u64;
            ticks.insert(tick);
            tick
        }
        None => *ticks.iter().last().unwrap(),
    };
    let ticks: Vec<u64> = ticks.into_iter().collect();
    let row_of: HashMap<u64, usize> = ticks.iter().enumerate().map(|(i, &t)| (t, i)).collect();

    let num_racks = builder.num_racks;
    let mut words = vec![vec![BIT_NOP; num_racks]; ticks.len()];
    let mut changed = vec![vec![false; num_racks]; ticks.len()];
    let mut conflicts = ConflictTable::new();

    for e in &builder.emissions {
        let row = row_of[&e.tick];
        let rack = e.rack as usize;
        let slot = &mut words[row][rack];
        if *slot == BIT_NOP || *slot == e.word {
            *slot = e.word;
            changed[row][rack] = true;
        } else {
            conflicts.push(ConflictRow {
                channel: e.channel.clone(),
                rack: e.rack,
                address: e.address,
                sample_index: row,
                time: e.tick as f64 / board.bus_rate,
                old_word: *slot,
                new_word: e.word,
            });
        }
    }
    if !conflicts.is_empty() {
        return Err(CompileError::Conflicts(conflicts));
    }

    // Control bits OR in conflict-free after data placement
    let mut control = vec![false; ticks.len()];
    for &tick in &board.wait_ticks {
        control[row_of[&tick]] = true;
    }
    control[row_of[&stop_tick]] = true;
    for (row, &is_ctrl) in control.iter().enumerate() {
        if is_ctrl {
            for rack in 0..num_racks {
                words[row][rack] |= BIT_STOP;
            }
        }
    }

    // Compaction: keep rows that carry data, control or a no-op placeholder,
    // plus the endpoints
    let last = ticks.len() - 1;
    let kept: Vec<usize> = (0..ticks.len())
        .filter(|&row| {
            row == 0
                || row == last
                || control[row]
                || builder.placeholders.contains(&ticks[row])
                || (0..num_racks).any(|r| changed[row][r])
        })
        .collect();

    // Strobe alternation per rack over the retained rows; a suppressed tick
    // repeats the previous strobe level instead of toggling.
    let mut matrix = Array2::<u32>::zeros((kept.len(), 1 + num_racks));
    for rack in 0..num_racks {
        let mut strb = 0u32;
        for (out_row, &row) in kept.iter().enumerate() {
            let tick = ticks[row];
            let suppressed = builder.no_strb[rack].contains(&tick);
            if out_row == 0 {
                if suppressed {
                    return Err(CompileError::StrobeOnFirstSample {
                        board: board.name.clone(),
                        rack: rack as u8,
                    });
                }
                strb = 0;
            } else if !suppressed {
                strb ^= 1;
            }
            let mut word = words[row][rack];
            if strb == 1 {
                word |= BIT_STRB;
            }
            matrix[[out_row, 1 + rack]] = word;
        }
    }
    for (out_row, &row) in kept.iter().enumerate() {
        matrix[[out_row, 0]] = u32::try_from(ticks[row]).map_err(|_| {
            CompileError::TickOverflow { board: board.name.clone(), tick: ticks[row] }
        })?;
    }

    // Per-channel checksums: device address, then every word the channel
    // put on the bus, in order.
    let mut streams: IndexMap<String, (u8, Vec<u32>)> = IndexMap::new();
    for e in &builder.emissions {
        streams.entry(e.channel.clone()).or_insert_with(|| (e.address, Vec::new())).1.push(e.word);
    }
    let mut crcs = IndexMap::new();
    for (channel, (address, stream)) in streams {
        let mut digest = MATRIX_CRC.digest();
        digest.update(&[address]);
        for word in stream {
            digest.update(&word.to_le_bytes());
        }
        crcs.insert(channel, digest.finalize());
    }

    let init = init_block(exp, board_id);

    timer.tick_print(&format!("compiled board '{}' ({} samples)", board.name, kept.len()));
    Ok(BuildResult { matrix, init, final_values: builder.final_values, crcs })
}

/// Device-init block for one board: the init bursts of every device that
/// needs one, run back to back at the bus rate before any user data.
fn init_block(exp: &Experiment, board_id: BoardId) -> Array2<u32> {
    let board = exp.board(board_id);
    let num_racks = board.num_racks as usize;
    let mut rows: Vec<(u8, u32)> = Vec::new();
    for im_id in exp.board_im_ids(board_id) {
        let im = exp.im(im_id);
        if let DeviceModel::Dds(dds) = im.model {
            for word in dds.init_words(im.address) {
                rows.push((im.rack, word));
            }
        }
    }
    let mut init = Array2::<u32>::zeros((rows.len(), 1 + num_racks));
    for (row, &(rack, word)) in rows.iter().enumerate() {
        init[[row, 0]] = row as u32;
        for r in 0..num_racks {
            let mut w = if r == rack as usize { word } else { BIT_NOP };
            if row == rows.len() - 1 {
                w |= BIT_STOP;
            }
            if row % 2 == 1 {
                w |= BIT_STRB;
            }
            init[[row, 1 + r]] = w;
        }
    }
    init
}

/// CRC-32 of a full compiled matrix, all columns row-major. Used by the
/// worker to verify a stored shot before arming the boards.
pub fn matrix_crc(matrix: &Array2<u32>) -> u32 {
    let mut digest = MATRIX_CRC.digest();
    for word in matrix.iter() {
        digest.update(&word.to_le_bytes());
    }
    digest.finalize()
}
