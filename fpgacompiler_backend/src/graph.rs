//! Board graph and clockline router.
//!
//! The experiment owns the tree
//! `boards -> clocklines -> intermediate devices (IMs) -> channels`
//! in arena vectors with typed indices, so secondary boards can reference
//! their primary (and trigger channels on it) without reference cycles.
//!
//! An IM groups the channels that share one hardware address type; its
//! [`HardwareType`] tag decides how the matrix builder merges the channels'
//! words. Channels are created through the `add_*` methods below, which
//! resolve the connection string, route the channel onto a clockline and
//! validate the address invariants at insertion time (no partial side
//! effects on error).

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use regex::Regex;

use crate::conversion::UnitConversion;
use crate::encoder::{
    AddrKind, DdsSub, DdsVariant, DeviceModel, DacVariant, HardwareType, DDS_MIN_TIME_STEP,
    DIGITAL_PORT_BITS,
};
use crate::errors::CompileError;
use crate::instruction::Instruction;
use crate::words::MAX_FPGA_RATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoardId(pub(crate) usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClocklineId(pub(crate) usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImId(pub(crate) usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

/// How a secondary board receives its start trigger from the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Started through the primary's virtual trigger pseudoclock (sync out).
    Software,
    /// Started by a digital output line of the primary.
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardRole {
    Primary,
    Secondary { primary: BoardId, trigger: TriggerMode },
}

#[derive(Debug)]
pub struct Board {
    pub name: String,
    /// TCP endpoint, `"ip:port"`.
    pub endpoint: String,
    pub num_racks: u8,
    pub bus_rate: f64,
    pub role: BoardRole,
    pub shared_clocklines: bool,
    pub(crate) clocklines: Vec<ClocklineId>,
    /// Digital line on the primary reserved to hardware-trigger this board.
    pub(crate) trigger_channel: Option<ChannelId>,
    /// Explicit end-of-run time, set by [`Experiment::stop`].
    pub(crate) stop_time: Option<f64>,
    /// Mid-run stop markers (`WAIT`): ticks whose sample carries `BIT_STOP`.
    pub(crate) wait_ticks: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct Clockline {
    pub name: String,
    /// Owning board; with shared clocklines this may differ from the board a
    /// channel was declared on.
    pub board: BoardId,
    pub(crate) ims: Vec<ImId>,
}

/// Intermediate device: the channels sharing one (rack, address, device kind).
#[derive(Debug)]
pub struct Im {
    pub name: String,
    pub board: BoardId,
    pub clockline: ClocklineId,
    pub rack: u8,
    pub address: u8,
    pub model: DeviceModel,
    pub(crate) channels: Vec<ChannelId>,
}

impl Im {
    pub fn hardware_type(&self) -> HardwareType {
        self.model.hardware_type()
    }
}

/// One timed entry on a channel, keyed by bus tick in the channel's list.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelInstr {
    Analog(Instruction),
    Digital(bool),
    Dds { sub: DdsSub, value: f64, update: bool },
}

#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub connection: String,
    pub board: BoardId,
    pub im: ImId,
    pub rack: u8,
    pub address: u8,
    /// Bit position within the port word (digital); 0 otherwise.
    pub channel_bit: u8,
    pub conversion: Option<UnitConversion>,
    /// Reserved as a secondary-board start trigger; carries no user data.
    pub is_trigger: bool,
    pub(crate) instr_list: BTreeMap<u64, ChannelInstr>,
    /// Sample ticks with strobe toggling suppressed (`do_not_toggle_STRB`).
    pub(crate) no_strb_ticks: BTreeSet<u64>,
}

/// Resolved placement of a channel, as handed to GUI/worker code.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareInfo {
    pub hardware_type: HardwareType,
    pub board_name: String,
    pub clockline: String,
    pub rack: u8,
    pub address: u8,
    pub channel_bit: u8,
}

/// Parses a connection string into `(address, sub-channel)`.
///
/// Accepted forms: `"0x3"`, `"0x0/0x5"` (address / sub-channel), and
/// `"channel 2"` (bare sub-channel on address 0).
pub fn parse_connection(connection: &str) -> Option<(u8, Option<u8>)> {
    let hex = Regex::new(r"^0x([0-9a-fA-F]+)(?:/0x([0-9a-fA-F]+))?$").unwrap();
    let chan = Regex::new(r"^channel (\d+)$").unwrap();
    if let Some(caps) = hex.captures(connection.trim()) {
        let address = u8::from_str_radix(&caps[1], 16).ok()?;
        let sub = match caps.get(2) {
            Some(m) => Some(u8::from_str_radix(m.as_str(), 16).ok()?),
            None => None,
        };
        return Some((address, sub));
    }
    if let Some(caps) = chan.captures(connection.trim()) {
        let sub: u8 = caps[1].parse().ok()?;
        return Some((0, Some(sub)));
    }
    None
}

/// The whole experiment: the board graph plus every channel's instruction list.
///
/// Construct explicitly and pass through; the DSL front-end calls
/// `experiment.add_analog_out(...)` rather than free constructors, and worker
/// processes only ever see the compiled output, never this structure.
#[derive(Debug, Default)]
pub struct Experiment {
    pub(crate) boards: Vec<Board>,
    pub(crate) clocklines: Vec<Clockline>,
    pub(crate) ims: Vec<Im>,
    pub(crate) channels: Vec<Channel>,
    board_index: IndexMap<String, BoardId>,
    channel_index: IndexMap<String, ChannelId>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- board management -------------------------------------------------

    fn add_board_base(
        &mut self,
        name: &str,
        endpoint: &str,
        num_racks: u8,
        bus_rate: f64,
        role: BoardRole,
    ) -> Result<BoardId, CompileError> {
        if self.board_index.contains_key(name) {
            return Err(CompileError::DuplicateBoard(name.to_string()));
        }
        if bus_rate > MAX_FPGA_RATE {
            return Err(CompileError::BusRateTooHigh {
                board: name.to_string(),
                rate: bus_rate,
                max: MAX_FPGA_RATE,
            });
        }
        if !(1..=2).contains(&num_racks) {
            return Err(CompileError::BadRackCount { board: name.to_string(), num_racks });
        }
        let id = BoardId(self.boards.len());
        self.boards.push(Board {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            num_racks,
            bus_rate,
            role,
            shared_clocklines: false,
            clocklines: Vec::new(),
            trigger_channel: None,
            stop_time: None,
            wait_ticks: BTreeSet::new(),
        });
        self.board_index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Registers the primary board of the experiment.
    pub fn add_primary_board(
        &mut self,
        name: &str,
        endpoint: &str,
        num_racks: u8,
        bus_rate: f64,
    ) -> Result<BoardId, CompileError> {
        self.add_board_base(name, endpoint, num_racks, bus_rate, BoardRole::Primary)
    }

    /// Registers a secondary board slaved to `primary`.
    ///
    /// With [`TriggerMode::Hardware`] a free digital line on the primary is
    /// reserved as the start trigger; with [`TriggerMode::Software`] the
    /// secondary hangs off the primary's virtual trigger pseudoclock.
    pub fn add_secondary_board(
        &mut self,
        name: &str,
        endpoint: &str,
        num_racks: u8,
        bus_rate: f64,
        primary: &str,
        trigger: TriggerMode,
    ) -> Result<BoardId, CompileError> {
        let primary_id = self.board_id(primary)?;
        let id = self.add_board_base(
            name,
            endpoint,
            num_racks,
            bus_rate,
            BoardRole::Secondary { primary: primary_id, trigger },
        )?;
        if trigger == TriggerMode::Hardware {
            let trig_chan = self.reserve_trigger_line(primary_id, name)?;
            self.boards[id.0].trigger_channel = Some(trig_chan);
        }
        Ok(id)
    }

    /// Finds a free line in one of the primary's digital IMs and reserves it.
    fn reserve_trigger_line(
        &mut self,
        primary: BoardId,
        secondary_name: &str,
    ) -> Result<ChannelId, CompileError> {
        for im_id in self.board_im_ids(primary) {
            if self.ims[im_id.0].model != DeviceModel::DigitalPort {
                continue;
            }
            let used: BTreeSet<u8> = self.ims[im_id.0]
                .channels
                .iter()
                .map(|c| self.channels[c.0].channel_bit)
                .collect();
            if let Some(free_bit) = (0..DIGITAL_PORT_BITS as u8).find(|b| !used.contains(b)) {
                let im = &self.ims[im_id.0];
                let name = format!("{}_trigger", secondary_name);
                let connection = format!("0x{:x}/0x{:x}", im.address, free_bit);
                let chan = Channel {
                    name: name.clone(),
                    connection,
                    board: im.board,
                    im: im_id,
                    rack: im.rack,
                    address: im.address,
                    channel_bit: free_bit,
                    conversion: None,
                    is_trigger: true,
                    instr_list: BTreeMap::new(),
                    no_strb_ticks: BTreeSet::new(),
                };
                let chan_id = ChannelId(self.channels.len());
                self.channels.push(chan);
                self.ims[im_id.0].channels.push(chan_id);
                self.channel_index.insert(name, chan_id);
                return Ok(chan_id);
            }
        }
        Err(CompileError::MissingTrigger { board: secondary_name.to_string() })
    }

    /// Opts a board into the shared-clockline search.
    pub fn set_shared_clocklines(&mut self, board: &str, shared: bool) -> Result<(), CompileError> {
        let id = self.board_id(board)?;
        self.boards[id.0].shared_clocklines = shared;
        Ok(())
    }

    pub fn board_id(&self, name: &str) -> Result<BoardId, CompileError> {
        self.board_index
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::NoSuchBoard(name.to_string()))
    }

    pub fn board(&self, id: BoardId) -> &Board {
        &self.boards[id.0]
    }

    pub fn boards(&self) -> impl Iterator<Item = (BoardId, &Board)> {
        self.boards.iter().enumerate().map(|(i, b)| (BoardId(i), b))
    }

    pub fn channel_id(&self, name: &str) -> Result<ChannelId, CompileError> {
        self.channel_index
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::NoSuchChannel(name.to_string()))
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.0]
    }

    pub fn im(&self, id: ImId) -> &Im {
        &self.ims[id.0]
    }

    /// IM ids under a board, including IMs this board placed on another
    /// board's shared clockline (their `board` field records the owner).
    pub fn board_im_ids(&self, board: BoardId) -> Vec<ImId> {
        self.ims
            .iter()
            .enumerate()
            .filter(|(_, im)| im.board == board)
            .map(|(i, _)| ImId(i))
            .collect()
    }

    // ---- channel creation -------------------------------------------------

    fn check_channel_name(&self, name: &str) -> Result<(), CompileError> {
        if self.channel_index.contains_key(name) {
            return Err(CompileError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn check_rack(&self, board: BoardId, rack: u8) -> Result<(), CompileError> {
        let b = &self.boards[board.0];
        if rack >= b.num_racks {
            return Err(CompileError::RackOutOfRange {
                board: b.name.clone(),
                rack,
                num_racks: b.num_racks,
            });
        }
        Ok(())
    }

    /// Finds or creates the clockline a new IM goes under.
    ///
    /// Clockline names default to `"<board>_<kind>_<address>"`. A board that
    /// opted into shared clocklines instead uses `"shared_<kind>_<address>"`
    /// and reuses an existing clockline of that name from any board of the
    /// experiment; the clockline's `board` field keeps recording the owner.
    fn route_clockline(&mut self, board: BoardId, kind: &str, address: u8) -> ClocklineId {
        let shared = self.boards[board.0].shared_clocklines;
        let name = if shared {
            format!("shared_{}_0x{:x}", kind, address)
        } else {
            format!("{}_{}_0x{:x}", self.boards[board.0].name, kind, address)
        };
        let search: Box<dyn Iterator<Item = ClocklineId>> = if shared {
            Box::new(self.clocklines.iter().enumerate().map(|(i, _)| ClocklineId(i)))
        } else {
            Box::new(self.boards[board.0].clocklines.iter().copied())
        };
        for cl_id in search {
            if self.clocklines[cl_id.0].name == name {
                return cl_id;
            }
        }
        let id = ClocklineId(self.clocklines.len());
        self.clocklines.push(Clockline { name, board, ims: Vec::new() });
        self.boards[board.0].clocklines.push(id);
        id
    }

    /// Finds or creates the IM for `(board, rack, address, model)`, enforcing
    /// the shared-address rule: two channels may share `(rack, address)` only
    /// inside one merged (or multiple) IM, never across IMs.
    fn route_im(
        &mut self,
        board: BoardId,
        rack: u8,
        address: u8,
        model: DeviceModel,
        channel_name: &str,
    ) -> Result<ImId, CompileError> {
        for im_id in self.board_im_ids(board) {
            let im = &self.ims[im_id.0];
            if im.rack != rack || im.address != address {
                continue;
            }
            let compatible = im.model == model && im.hardware_type().addr == AddrKind::Merged;
            if compatible {
                return Ok(im_id);
            }
            // Any other co-located IM (or a second channel on a single/multiple
            // address) is a user error; name both parties.
            let first = im
                .channels
                .first()
                .map(|c| self.channels[c.0].name.clone())
                .unwrap_or_else(|| im.name.clone());
            return Err(CompileError::DuplicateAddress {
                board: self.boards[board.0].name.clone(),
                rack,
                address,
                first,
                second: channel_name.to_string(),
            });
        }
        let clockline = self.route_clockline(board, model.kind_str(), address);
        let id = ImId(self.ims.len());
        self.ims.push(Im {
            name: format!("{}_{}_0x{:x}", self.boards[board.0].name, model.kind_str(), address),
            board,
            clockline,
            rack,
            address,
            model,
            channels: Vec::new(),
        });
        self.clocklines[clockline.0].ims.push(id);
        Ok(id)
    }

    fn add_channel_base(
        &mut self,
        board: BoardId,
        name: &str,
        connection: &str,
        rack: u8,
        address: u8,
        model: DeviceModel,
        channel_bit: u8,
        conversion: Option<UnitConversion>,
    ) -> Result<ChannelId, CompileError> {
        let im = self.route_im(board, rack, address, model, name)?;
        // Within a merged IM the line must still be unique
        if model == DeviceModel::DigitalPort {
            for &c in &self.ims[im.0].channels {
                if self.channels[c.0].channel_bit == channel_bit {
                    return Err(CompileError::DuplicateAddress {
                        board: self.boards[board.0].name.clone(),
                        rack,
                        address,
                        first: self.channels[c.0].name.clone(),
                        second: name.to_string(),
                    });
                }
            }
        }
        let id = ChannelId(self.channels.len());
        self.channels.push(Channel {
            name: name.to_string(),
            connection: connection.to_string(),
            board,
            im,
            rack,
            address,
            channel_bit,
            conversion,
            is_trigger: false,
            instr_list: BTreeMap::new(),
            no_strb_ticks: BTreeSet::new(),
        });
        self.ims[im.0].channels.push(id);
        self.channel_index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Registers an analog output channel.
    pub fn add_analog_out(
        &mut self,
        board: &str,
        name: &str,
        connection: &str,
        rack: u8,
        dac: DacVariant,
        conversion: Option<UnitConversion>,
    ) -> Result<ChannelId, CompileError> {
        let board_id = self.board_id(board)?;
        self.check_channel_name(name)?;
        self.check_rack(board_id, rack)?;
        let (address, sub) = parse_connection(connection).ok_or_else(|| {
            CompileError::InvalidConnection {
                channel: name.to_string(),
                connection: connection.to_string(),
            }
        })?;
        if sub.is_some() {
            return Err(CompileError::InvalidConnection {
                channel: name.to_string(),
                connection: connection.to_string(),
            });
        }
        self.add_channel_base(
            board_id,
            name,
            connection,
            rack,
            address,
            DeviceModel::Dac(dac),
            0,
            conversion,
        )
    }

    /// Registers a digital output line; connection form `"0xA/0xB"` (port
    /// address / line) or `"channel N"` (line on port 0).
    pub fn add_digital_out(
        &mut self,
        board: &str,
        name: &str,
        connection: &str,
        rack: u8,
    ) -> Result<ChannelId, CompileError> {
        let board_id = self.board_id(board)?;
        self.check_channel_name(name)?;
        self.check_rack(board_id, rack)?;
        let (address, sub) = match parse_connection(connection) {
            Some((address, Some(sub))) if (sub as u32) < DIGITAL_PORT_BITS => (address, sub),
            _ => {
                return Err(CompileError::InvalidConnection {
                    channel: name.to_string(),
                    connection: connection.to_string(),
                })
            }
        };
        self.add_channel_base(
            board_id,
            name,
            connection,
            rack,
            address,
            DeviceModel::DigitalPort,
            sub,
            None,
        )
    }

    /// Registers a DDS channel; its address must be 4-aligned.
    pub fn add_dds(
        &mut self,
        board: &str,
        name: &str,
        connection: &str,
        rack: u8,
        dds: DdsVariant,
    ) -> Result<ChannelId, CompileError> {
        let board_id = self.board_id(board)?;
        self.check_channel_name(name)?;
        self.check_rack(board_id, rack)?;
        let (address, sub) = parse_connection(connection).ok_or_else(|| {
            CompileError::InvalidConnection {
                channel: name.to_string(),
                connection: connection.to_string(),
            }
        })?;
        if sub.is_some() {
            return Err(CompileError::InvalidConnection {
                channel: name.to_string(),
                connection: connection.to_string(),
            });
        }
        if address % 4 != 0 {
            return Err(CompileError::DdsAlignment { channel: name.to_string(), address });
        }
        self.add_channel_base(board_id, name, connection, rack, address, DeviceModel::Dds(dds), 0, None)
    }

    /// Resolves a channel to its routed hardware placement.
    pub fn hardware_info(&self, channel: &str) -> Result<HardwareInfo, CompileError> {
        let id = self.channel_id(channel)?;
        let chan = &self.channels[id.0];
        let im = &self.ims[chan.im.0];
        let mut hardware_type = im.hardware_type();
        if chan.is_trigger {
            hardware_type.sub = crate::encoder::Sub::Trigger;
        }
        Ok(HardwareInfo {
            hardware_type,
            board_name: self.boards[im.board.0].name.clone(),
            clockline: self.clocklines[im.clockline.0].name.clone(),
            rack: chan.rack,
            address: chan.address,
            channel_bit: chan.channel_bit,
        })
    }

    // ---- instruction placement -------------------------------------------

    fn tick_of(&self, channel: ChannelId, t: f64) -> Result<u64, CompileError> {
        if t < 0.0 {
            return Err(CompileError::NegativeTime {
                channel: self.channels[channel.0].name.clone(),
                time: t,
            });
        }
        let rate = self.boards[self.channels[channel.0].board.0].bus_rate;
        Ok((t * rate).round() as u64)
    }

    fn insert_instr(
        &mut self,
        channel: ChannelId,
        t: f64,
        instr: ChannelInstr,
    ) -> Result<u64, CompileError> {
        let tick = self.tick_of(channel, t)?;
        let chan = &mut self.channels[channel.0];
        if chan.instr_list.contains_key(&tick) {
            return Err(CompileError::TimeCollision { channel: chan.name.clone(), time: t, tick });
        }
        chan.instr_list.insert(tick, instr);
        Ok(tick)
    }

    /// Places a scalar analog set-point at `t` (user units).
    pub fn set(&mut self, channel: &str, t: f64, value: f64) -> Result<(), CompileError> {
        self.set_instr(channel, t, Instruction::new_const(value))
    }

    /// Places a general analog instruction (constant, ramp or series) at `t`.
    pub fn set_instr(
        &mut self,
        channel: &str,
        t: f64,
        instr: Instruction,
    ) -> Result<(), CompileError> {
        let id = self.channel_id(channel)?;
        let chan = &self.channels[id.0];
        let name = chan.name.clone();
        // Validate ramp/series shape before committing anything
        match &instr {
            Instruction::Ramp { t0, t1, clock_rate, .. } => {
                if !(t1 > t0) || !(*clock_rate > 0.0) {
                    return Err(CompileError::BadRamp {
                        channel: name,
                        t0: *t0,
                        t1: *t1,
                        clock_rate: *clock_rate,
                    });
                }
            }
            Instruction::Series { times, values } => {
                if times.len() != values.len() || times.is_empty() {
                    return Err(CompileError::BadSeries {
                        channel: name,
                        times: times.len(),
                        values: values.len(),
                    });
                }
            }
            Instruction::Const(_) => {}
        }
        if let Some(conv) = &chan.conversion {
            if let Instruction::Const(value) = instr {
                let (lo, hi) = (conv.min().min(conv.max()), conv.min().max(conv.max()));
                if value < lo || value > hi {
                    return Err(CompileError::ValueOutOfRange {
                        channel: chan.name.clone(),
                        value,
                        min: lo,
                        max: hi,
                    });
                }
            }
        }
        self.insert_instr(id, t, ChannelInstr::Analog(instr))?;
        Ok(())
    }

    pub fn go_high(&mut self, channel: &str, t: f64) -> Result<(), CompileError> {
        let id = self.channel_id(channel)?;
        self.insert_instr(id, t, ChannelInstr::Digital(true))?;
        Ok(())
    }

    pub fn go_low(&mut self, channel: &str, t: f64) -> Result<(), CompileError> {
        let id = self.channel_id(channel)?;
        self.insert_instr(id, t, ChannelInstr::Digital(false))?;
        Ok(())
    }

    fn dds_op(
        &mut self,
        channel: &str,
        t: f64,
        sub: DdsSub,
        value: f64,
        update: bool,
    ) -> Result<f64, CompileError> {
        let id = self.channel_id(channel)?;
        let im = &self.ims[self.channels[id.0].im.0];
        let variant = match im.model {
            DeviceModel::Dds(v) => v,
            _ => {
                return Err(CompileError::InvalidConnection {
                    channel: channel.to_string(),
                    connection: self.channels[id.0].connection.clone(),
                })
            }
        };
        let words = variant.regs(sub).len();
        self.insert_instr(id, t, ChannelInstr::Dds { sub, value, update })?;
        // Each emitted word advances time by the device's minimum step
        Ok(t + words as f64 * DDS_MIN_TIME_STEP)
    }

    /// Programs a frequency (Hz) at `t`; returns the time after the burst.
    pub fn set_freq(&mut self, channel: &str, t: f64, freq: f64, update: bool) -> Result<f64, CompileError> {
        self.dds_op(channel, t, DdsSub::Freq, freq, update)
    }

    /// Programs an amplitude (dBm) at `t`; returns the time after the burst.
    pub fn set_amp(&mut self, channel: &str, t: f64, amp: f64, update: bool) -> Result<f64, CompileError> {
        self.dds_op(channel, t, DdsSub::Amp, amp, update)
    }

    /// Programs a phase (degrees) at `t`; returns the time after the burst.
    pub fn set_phase(&mut self, channel: &str, t: f64, phase: f64, update: bool) -> Result<f64, CompileError> {
        self.dds_op(channel, t, DdsSub::Phase, phase, update)
    }

    /// Suppresses strobe toggling for the sample this channel places at `t`.
    pub fn do_not_toggle_strb(&mut self, channel: &str, t: f64) -> Result<(), CompileError> {
        let id = self.channel_id(channel)?;
        let tick = self.tick_of(id, t)?;
        self.channels[id.0].no_strb_ticks.insert(tick);
        Ok(())
    }

    /// Inserts a mid-run stop marker (`WAIT`): the board pauses at this tick
    /// until its restart trigger fires.
    pub fn wait(&mut self, board: &str, t: f64) -> Result<(), CompileError> {
        let id = self.board_id(board)?;
        if t < 0.0 {
            return Err(CompileError::NegativeTime { channel: board.to_string(), time: t });
        }
        let tick = (t * self.boards[id.0].bus_rate).round() as u64;
        self.boards[id.0].wait_ticks.insert(tick);
        Ok(())
    }

    /// Declares the end-of-run time; the final sample carries `BIT_STOP`.
    pub fn stop(&mut self, board: &str, t: f64) -> Result<(), CompileError> {
        let id = self.board_id(board)?;
        if t < 0.0 {
            return Err(CompileError::NegativeTime { channel: board.to_string(), time: t });
        }
        self.boards[id.0].stop_time = Some(t);
        Ok(())
    }
}
