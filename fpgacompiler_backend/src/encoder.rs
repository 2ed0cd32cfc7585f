//! Per-device hardware encoders: user value to one or more 32-bit bus words,
//! and the inverse for trace display.
//!
//! The device catalog is a pair of tagged enums ([`DacVariant`], [`DdsVariant`])
//! rather than dynamically bound classes; the matrix builder never branches on
//! the concrete model, only on the [`HardwareType`] tag.
//!
//! ## Word formats
//!
//! - **Analog**: one word per sample; the 16-bit DAC code sits in the low bits
//!   of the data field.
//! - **Digital**: one word per sample per address; channels sharing the
//!   address OR their bit into a 16-bit port word.
//! - **DDS**: one word per register byte. The data field packs
//!   `byte | reg << DDS_REG_SHIFT | DDS_WRITE [| DDS_UPDATE]`; `DDS_UPDATE`
//!   (forming `WRITE_AND_UPDATE`) is set only on the last word of a burst when
//!   the caller requests an output-stage update, so bursts can be batched.

use std::collections::HashMap;
use std::fmt;

use crate::words::{address_of, data_of, pack};

// DDS payload sub-fields within the 18-bit data field.
pub const DDS_VALUE_SHIFT: u32 = 0;
pub const DDS_REG_SHIFT: u32 = 8;
pub const DDS_REG_MASK: u32 = 0x7f;
pub const DDS_WRITE: u32 = 1 << 15;
pub const DDS_UPDATE: u32 = 1 << 16;

/// Minimum spacing between consecutive DDS words, in seconds.
pub const DDS_MIN_TIME_STEP: f64 = 1e-6;

// Sentinels reported for out-of-range DDS programming; the offending sample
// is transmitted as NOP.
pub const DDS_FREQ_INVALID_VALUE: f64 = -1.0;
pub const DDS_AMP_INVALID_VALUE: f64 = -1000.0;
pub const DDS_PHASE_INVALID_VALUE: f64 = -1.0;

/// Major device class of an intermediate device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Major {
    Analog,
    Digital,
    Dds,
}

/// Sub-classification of an intermediate device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sub {
    None,
    Static,
    Trigger,
    Virtual,
}

/// How per-channel data of an intermediate device pack into bus words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    /// One channel owns the address exclusively (analog).
    Single,
    /// Channels sharing the address OR their bits together (digital).
    Merged,
    /// One sample expands into several consecutively addressed words (DDS).
    Multiple,
}

/// The 3-char hardware-type tag `(major, sub, addr)` the matrix builder
/// branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareType {
    pub major: Major,
    pub sub: Sub,
    pub addr: AddrKind,
}

impl HardwareType {
    pub fn new(major: Major, sub: Sub, addr: AddrKind) -> Self {
        Self { major, sub, addr }
    }
    pub fn tag(&self) -> [char; 3] {
        [
            match self.major {
                Major::Analog => 'a',
                Major::Digital => 'd',
                Major::Dds => 'f',
            },
            match self.sub {
                Sub::None => 'n',
                Sub::Static => 's',
                Sub::Trigger => 't',
                Sub::Virtual => 'v',
            },
            match self.addr {
                AddrKind::Single => 's',
                AddrKind::Merged => 'm',
                AddrKind::Multiple => 'x',
            },
        ]
    }
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        write!(f, "{}{}{}", tag[0], tag[1], tag[2])
    }
}

/// Supported DAC models. All drive +/-10 V full scale; they differ in the
/// 16-bit code representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacVariant {
    /// 16-bit two's complement.
    Dac712,
    /// 16-bit straight binary (unipolar code, bipolar output).
    Dac715,
    /// 16-bit two's complement, quad DAC.
    Dac7744,
}

impl DacVariant {
    pub fn volt_min(&self) -> f64 {
        -10.0
    }
    pub fn volt_max(&self) -> f64 {
        10.0
    }

    /// Clamps `volts` to the hardware range and encodes the 16-bit DAC code.
    pub fn to_code(&self, volts: f64) -> u16 {
        let v = volts.clamp(self.volt_min(), self.volt_max());
        match self {
            DacVariant::Dac712 | DacVariant::Dac7744 => {
                let code = (v / self.volt_max() * 32767.0).round() as i16;
                code as u16
            }
            DacVariant::Dac715 => {
                ((v - self.volt_min()) / (self.volt_max() - self.volt_min()) * 65535.0).round()
                    as u16
            }
        }
    }

    pub fn from_code(&self, code: u16) -> f64 {
        match self {
            DacVariant::Dac712 | DacVariant::Dac7744 => {
                (code as i16) as f64 / 32767.0 * self.volt_max()
            }
            DacVariant::Dac715 => {
                code as f64 / 65535.0 * (self.volt_max() - self.volt_min()) + self.volt_min()
            }
        }
    }

    /// One bus word per analog sample.
    pub fn encode(&self, address: u8, volts: f64) -> u32 {
        pack(address, self.to_code(volts) as u32)
    }

    /// Inverse of [`DacVariant::encode`] for words matching `address`.
    pub fn decode(&self, address: u8, times: &[f64], words: &[u32]) -> (Vec<f64>, Vec<f64>) {
        let mut out_t = Vec::new();
        let mut out_v = Vec::new();
        for (&t, &w) in times.iter().zip(words.iter()) {
            if crate::words::is_nop(w) || address_of(w) != address {
                continue;
            }
            out_t.push(t);
            out_v.push(self.from_code(data_of(w) as u16));
        }
        (out_t, out_v)
    }
}

/// Width of the shared digital port word.
pub const DIGITAL_PORT_BITS: u32 = 16;

/// Combines per-line levels into the 16-bit port word sharing one address.
pub fn combine_digital(bits: &[(u8, bool)]) -> u32 {
    let mut word = 0u32;
    for &(line, level) in bits {
        debug_assert!((line as u32) < DIGITAL_PORT_BITS);
        word |= (level as u32) << line;
    }
    word
}

/// DDS register group selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DdsSub {
    Freq,
    Amp,
    Phase,
}

impl fmt::Display for DdsSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DdsSub::Freq => "freq",
                DdsSub::Amp => "amp",
                DdsSub::Phase => "phase",
            }
        )
    }
}

/// Supported DDS models plus a generic fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdsVariant {
    Ad9854,
    Ad9858,
    Ad9915,
    Generic,
}

impl DdsVariant {
    pub fn sysclk(&self) -> f64 {
        match self {
            DdsVariant::Ad9854 => 300e6,
            DdsVariant::Ad9858 => 1e9,
            DdsVariant::Ad9915 => 2.5e9,
            DdsVariant::Generic => 1e9,
        }
    }

    pub fn freq_bits(&self) -> u32 {
        match self {
            DdsVariant::Ad9854 => 48,
            _ => 32,
        }
    }

    pub fn amp_bits(&self) -> u32 {
        match self {
            DdsVariant::Ad9854 => 12,
            DdsVariant::Ad9858 => 8,
            DdsVariant::Ad9915 | DdsVariant::Generic => 12,
        }
    }

    pub fn phase_bits(&self) -> u32 {
        match self {
            DdsVariant::Ad9854 | DdsVariant::Ad9858 => 14,
            DdsVariant::Ad9915 | DdsVariant::Generic => 16,
        }
    }

    /// Register addresses receiving the tuning-word bytes, LSB first.
    pub fn regs(&self, sub: DdsSub) -> &'static [u8] {
        match (self, sub) {
            (DdsVariant::Ad9854, DdsSub::Freq) => &[0x04, 0x05, 0x06, 0x07, 0x08, 0x09],
            (DdsVariant::Ad9854, DdsSub::Amp) => &[0x26, 0x27],
            (DdsVariant::Ad9854, DdsSub::Phase) => &[0x00, 0x01],
            (DdsVariant::Ad9858, DdsSub::Freq) => &[0x0a, 0x0b, 0x0c, 0x0d],
            (DdsVariant::Ad9858, DdsSub::Amp) => &[0x40],
            (DdsVariant::Ad9858, DdsSub::Phase) => &[0x0e, 0x0f],
            (DdsVariant::Ad9915, DdsSub::Freq) => &[0x2c, 0x2d, 0x2e, 0x2f],
            (DdsVariant::Ad9915, DdsSub::Amp) => &[0x30, 0x31],
            (DdsVariant::Ad9915, DdsSub::Phase) => &[0x32, 0x33],
            (DdsVariant::Generic, DdsSub::Freq) => &[0x00, 0x01, 0x02, 0x03],
            (DdsVariant::Generic, DdsSub::Amp) => &[0x04, 0x05],
            (DdsVariant::Generic, DdsSub::Phase) => &[0x06, 0x07],
        }
    }

    /// Amplitude range in dBm mapped linearly onto the amplitude word.
    pub fn amp_min(&self) -> f64 {
        -48.0
    }
    pub fn amp_max(&self) -> f64 {
        0.0
    }

    /// Smallest representable frequency step, `SYSCLK / 2^FREQ_BITS`.
    pub fn freq_quantum(&self) -> f64 {
        self.sysclk() / 2f64.powi(self.freq_bits() as i32)
    }
    pub fn amp_quantum(&self) -> f64 {
        (self.amp_max() - self.amp_min()) / ((1u64 << self.amp_bits()) - 1) as f64
    }
    pub fn phase_quantum(&self) -> f64 {
        360.0 / 2f64.powi(self.phase_bits() as i32)
    }

    pub fn invalid_value(sub: DdsSub) -> f64 {
        match sub {
            DdsSub::Freq => DDS_FREQ_INVALID_VALUE,
            DdsSub::Amp => DDS_AMP_INVALID_VALUE,
            DdsSub::Phase => DDS_PHASE_INVALID_VALUE,
        }
    }

    /// Converts a user value into the integer tuning word.
    ///
    /// Returns `None` for out-of-range input; the caller is expected to NOP
    /// the sample and record the matching `DDS_*_INVALID_VALUE` sentinel.
    pub fn tuning_word(&self, sub: DdsSub, value: f64) -> Option<u64> {
        match sub {
            DdsSub::Freq => {
                if !(0.0..=self.sysclk() / 2.0).contains(&value) {
                    return None;
                }
                // ftw = round(f * 2^FREQ_BITS / SYSCLK)
                // NOTE(AD9915): linear map taken at face value here; the scaling
                // in the AD9915 datasheet (table 6) still needs to be verified
                // against hardware before trusting absolute frequencies.
                Some((value * 2f64.powi(self.freq_bits() as i32) / self.sysclk()).round() as u64)
            }
            DdsSub::Amp => {
                if !(self.amp_min()..=self.amp_max()).contains(&value) {
                    return None;
                }
                let span = ((1u64 << self.amp_bits()) - 1) as f64;
                Some(((value - self.amp_min()) / (self.amp_max() - self.amp_min()) * span).round()
                    as u64)
            }
            DdsSub::Phase => {
                if !value.is_finite() {
                    return None;
                }
                let full = 2f64.powi(self.phase_bits() as i32);
                let turns = (value.rem_euclid(360.0)) / 360.0;
                Some(((turns * full).round() as u64) % (1u64 << self.phase_bits()))
            }
        }
    }

    /// Inverse of [`DdsVariant::tuning_word`].
    pub fn value_of_word(&self, sub: DdsSub, word: u64) -> f64 {
        match sub {
            DdsSub::Freq => word as f64 * self.sysclk() / 2f64.powi(self.freq_bits() as i32),
            DdsSub::Amp => {
                let span = ((1u64 << self.amp_bits()) - 1) as f64;
                word as f64 / span * (self.amp_max() - self.amp_min()) + self.amp_min()
            }
            DdsSub::Phase => word as f64 / 2f64.powi(self.phase_bits() as i32) * 360.0,
        }
    }

    /// Encodes one register-burst for a value update.
    ///
    /// Emits `regs(sub).len()` words, one per register byte LSB-first. All
    /// words carry `DDS_WRITE`; the last one additionally carries `DDS_UPDATE`
    /// iff `update` is set.
    pub fn encode(&self, address: u8, sub: DdsSub, value: f64, update: bool) -> Option<Vec<u32>> {
        let word = self.tuning_word(sub, value)?;
        let regs = self.regs(sub);
        let mut out = Vec::with_capacity(regs.len());
        for (i, &reg) in regs.iter().enumerate() {
            let byte = ((word >> (8 * i)) & 0xff) as u32;
            let mut data = (byte << DDS_VALUE_SHIFT)
                | (((reg as u32) & DDS_REG_MASK) << DDS_REG_SHIFT)
                | DDS_WRITE;
            if update && i == regs.len() - 1 {
                data |= DDS_UPDATE;
            }
            out.push(pack(address, data));
        }
        Some(out)
    }

    /// Reconstructs values from a word stream for trace display.
    ///
    /// Tracks register writes addressed to this device and emits the value of
    /// the `sub` register group on each `WRITE_AND_UPDATE`, once all of the
    /// group's registers have been written at least once.
    pub fn decode(
        &self,
        address: u8,
        sub: DdsSub,
        times: &[f64],
        words: &[u32],
    ) -> (Vec<f64>, Vec<f64>) {
        let regs = self.regs(sub);
        let mut reg_file: HashMap<u8, u8> = HashMap::new();
        let mut out_t = Vec::new();
        let mut out_v = Vec::new();
        for (&t, &w) in times.iter().zip(words.iter()) {
            if crate::words::is_nop(w) || address_of(w) != address {
                continue;
            }
            let data = data_of(w);
            if data & DDS_WRITE == 0 {
                continue;
            }
            let reg = ((data >> DDS_REG_SHIFT) & DDS_REG_MASK) as u8;
            let byte = (data >> DDS_VALUE_SHIFT) as u8;
            reg_file.insert(reg, byte);
            if data & DDS_UPDATE != 0 && regs.iter().all(|r| reg_file.contains_key(r)) {
                let mut word = 0u64;
                for (i, r) in regs.iter().enumerate() {
                    word |= (reg_file[r] as u64) << (8 * i);
                }
                out_t.push(t);
                out_v.push(self.value_of_word(sub, word));
            }
        }
        (out_t, out_v)
    }

    /// Control-register initialization burst emitted before any user data.
    pub fn init_words(&self, address: u8) -> Vec<u32> {
        let ctrl_regs: &[u8] = match self {
            DdsVariant::Ad9854 => &[0x1d, 0x1e, 0x1f, 0x20],
            DdsVariant::Ad9858 => &[0x00, 0x01, 0x02, 0x03],
            DdsVariant::Ad9915 | DdsVariant::Generic => &[0x00, 0x01],
        };
        let mut out = Vec::with_capacity(ctrl_regs.len());
        for (i, &reg) in ctrl_regs.iter().enumerate() {
            let mut data = (((reg as u32) & DDS_REG_MASK) << DDS_REG_SHIFT) | DDS_WRITE;
            if i == ctrl_regs.len() - 1 {
                data |= DDS_UPDATE;
            }
            out.push(pack(address, data));
        }
        out
    }

    /// Reset burst: same control registers, output stage updated once.
    pub fn reset_words(&self, address: u8) -> Vec<u32> {
        self.init_words(address)
    }

    /// Power-down burst emitted at experiment teardown.
    pub fn shutdown_words(&self, address: u8) -> Vec<u32> {
        // Single control write with the power-down bit in the payload byte
        vec![pack(
            address,
            (1 << DDS_VALUE_SHIFT)
                | ((self.regs(DdsSub::Freq)[0] as u32 & DDS_REG_MASK) << DDS_REG_SHIFT)
                | DDS_WRITE
                | DDS_UPDATE,
        )]
    }
}

/// The concrete device behind an intermediate device, as a tagged variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    Dac(DacVariant),
    DigitalPort,
    Dds(DdsVariant),
    /// Pseudo-device contributing only control bits (strobe/stop/no-op).
    Control,
}

impl DeviceModel {
    pub fn hardware_type(&self) -> HardwareType {
        match self {
            DeviceModel::Dac(_) => HardwareType::new(Major::Analog, Sub::None, AddrKind::Single),
            DeviceModel::DigitalPort => {
                HardwareType::new(Major::Digital, Sub::None, AddrKind::Merged)
            }
            DeviceModel::Dds(_) => HardwareType::new(Major::Dds, Sub::None, AddrKind::Multiple),
            DeviceModel::Control => {
                HardwareType::new(Major::Digital, Sub::Virtual, AddrKind::Merged)
            }
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            DeviceModel::Dac(_) => "ao",
            DeviceModel::DigitalPort => "do",
            DeviceModel::Dds(_) => "dds",
            DeviceModel::Control => "ctrl",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dac712_codes() {
        let dac = DacVariant::Dac712;
        assert_eq!(dac.to_code(0.0), 0);
        assert_eq!(dac.to_code(10.0), 32767);
        assert_eq!(dac.to_code(-10.0), (-32767i16) as u16);
        // Out-of-range input clamps
        assert_eq!(dac.to_code(15.0), 32767);
        let v = 3.21;
        assert!((dac.from_code(dac.to_code(v)) - v).abs() < 20.0 / 65536.0);
    }

    #[test]
    fn dac715_codes() {
        let dac = DacVariant::Dac715;
        assert_eq!(dac.to_code(-10.0), 0);
        assert_eq!(dac.to_code(10.0), 65535);
        let v = -1.234;
        assert!((dac.from_code(dac.to_code(v)) - v).abs() < 20.0 / 65536.0);
    }

    #[test]
    fn hardware_type_tags() {
        assert_eq!(DeviceModel::Dac(DacVariant::Dac712).hardware_type().to_string(), "ans");
        assert_eq!(DeviceModel::DigitalPort.hardware_type().to_string(), "dnm");
        assert_eq!(DeviceModel::Dds(DdsVariant::Ad9854).hardware_type().to_string(), "fnx");
        assert_eq!(DeviceModel::Control.hardware_type().to_string(), "dvm");
    }

    #[test]
    fn digital_combine() {
        assert_eq!(combine_digital(&[(0, true), (1, true)]), 0b11);
        assert_eq!(combine_digital(&[(0, false), (1, true), (5, true)]), 0b10_0010);
    }

    #[test]
    fn ad9854_freq_burst_layout() {
        let dds = DdsVariant::Ad9854;
        let words = dds.encode(0x10, DdsSub::Freq, 10e6, false).unwrap();
        assert_eq!(words.len(), 6);
        for (i, &w) in words.iter().enumerate() {
            assert_eq!(address_of(w), 0x10);
            let data = data_of(w);
            assert_eq!((data >> DDS_REG_SHIFT) & DDS_REG_MASK, 0x04 + i as u32);
            assert!(data & DDS_WRITE != 0);
            // update=false: no WRITE_AND_UPDATE even on the last word
            assert_eq!(data & DDS_UPDATE, 0);
        }

        let amp_words = dds.encode(0x10, DdsSub::Amp, -10.0, true).unwrap();
        assert_eq!(amp_words.len(), 2);
        assert_eq!((data_of(amp_words[0]) >> DDS_REG_SHIFT) & DDS_REG_MASK, 0x26);
        assert_eq!((data_of(amp_words[1]) >> DDS_REG_SHIFT) & DDS_REG_MASK, 0x27);
        assert_eq!(data_of(amp_words[0]) & DDS_UPDATE, 0);
        assert!(data_of(amp_words[1]) & DDS_UPDATE != 0);
    }

    #[test]
    fn dds_round_trip_within_quantum() {
        for variant in [DdsVariant::Ad9854, DdsVariant::Ad9858, DdsVariant::Ad9915, DdsVariant::Generic] {
            let f = 10e6;
            let ftw = variant.tuning_word(DdsSub::Freq, f).unwrap();
            assert!((variant.value_of_word(DdsSub::Freq, ftw) - f).abs() <= variant.freq_quantum());

            let a = -10.0;
            let atw = variant.tuning_word(DdsSub::Amp, a).unwrap();
            assert!((variant.value_of_word(DdsSub::Amp, atw) - a).abs() <= variant.amp_quantum());

            let p = 123.4;
            let ptw = variant.tuning_word(DdsSub::Phase, p).unwrap();
            assert!((variant.value_of_word(DdsSub::Phase, ptw) - p).abs() <= variant.phase_quantum());
        }
    }

    #[test]
    fn dds_out_of_range_is_sentinel() {
        let dds = DdsVariant::Ad9858;
        // Above Nyquist
        assert!(dds.encode(0x10, DdsSub::Freq, 0.6e9, true).is_none());
        assert!(dds.encode(0x10, DdsSub::Amp, 3.0, true).is_none());
        assert_eq!(DdsVariant::invalid_value(DdsSub::Freq), DDS_FREQ_INVALID_VALUE);
    }

    #[test]
    fn dds_decode_reconstructs_updates() {
        let dds = DdsVariant::Ad9854;
        let mut words = dds.encode(0x10, DdsSub::Freq, 10e6, false).unwrap();
        words.extend(dds.encode(0x10, DdsSub::Amp, -10.0, true).unwrap());
        let times: Vec<f64> = (0..words.len()).map(|i| i as f64 * 1e-6).collect();

        let (t_f, v_f) = dds.decode(0x10, DdsSub::Freq, &times, &words);
        // The frequency registers are complete once the amp burst's update fires
        assert_eq!(t_f.len(), 1);
        assert!((v_f[0] - 10e6).abs() <= dds.freq_quantum());

        let (_, v_a) = dds.decode(0x10, DdsSub::Amp, &times, &words);
        assert_eq!(v_a.len(), 1);
        assert!((v_a[0] - (-10.0)).abs() <= dds.amp_quantum());
    }

    #[test]
    fn startup_bursts_update_once() {
        for variant in [DdsVariant::Ad9854, DdsVariant::Ad9858, DdsVariant::Ad9915] {
            let words = variant.init_words(0x10);
            assert!(!words.is_empty());
            for (i, &w) in words.iter().enumerate() {
                assert_eq!(address_of(w), 0x10);
                assert!(data_of(w) & DDS_WRITE != 0);
                let is_last = i == words.len() - 1;
                assert_eq!(data_of(w) & DDS_UPDATE != 0, is_last);
            }
            assert_eq!(variant.reset_words(0x10), words);
            let down = variant.shutdown_words(0x10);
            assert_eq!(down.len(), 1);
            assert!(data_of(down[0]) & DDS_UPDATE != 0);
        }
    }

    #[test]
    fn decode_filters_other_addresses() {
        let dds = DdsVariant::Generic;
        let words = dds.encode(0x20, DdsSub::Freq, 1e6, true).unwrap();
        let times: Vec<f64> = (0..words.len()).map(|i| i as f64).collect();
        let (t, _) = dds.decode(0x24, DdsSub::Freq, &times, &words);
        assert!(t.is_empty());
    }
}
