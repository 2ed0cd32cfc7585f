//! Provides definitions and implementations for instruction-related functionalities.
//!
//! ## Main Structures and Enumerations:
//!
//! - `RampFunc`: An enumeration of the supported ramp shapes (`LINEAR`, `SINE`, `EXP`).
//!
//! - `Instruction`: a single timed entry on an output channel. It is either a
//!   scalar set-point (`Const`), a ramp descriptor carrying its own expansion
//!   clock rate, or an explicit `(times, values)` series inserted verbatim.
//!
//! ## Utilities:
//!
//! - The `RampArgs` type alias provides a convenient way to define ramp
//!   arguments using a dictionary with string keys and float values.
//!
//! - The module makes use of the `maplit` crate to enable easy creation of hashmaps.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use maplit::hashmap;

/// Type alias for ramp arguments: a dictionary with key-value pairs of
/// string (argument name) and float (value)
pub type RampArgs = HashMap<String, f64>;

/// Enum type for the supported ramp shapes.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RampFunc {
    LINEAR,
    SINE,
    EXP,
}
impl fmt::Display for RampFunc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RampFunc::LINEAR => "LINEAR",
                RampFunc::SINE => "SINE",
                RampFunc::EXP => "EXP",
            }
        )
    }
}

/// A single timed entry on an output channel.
///
/// ## Implemented ramp functions and their expected fields:
/// 1. `RampFunc::LINEAR`:
///    - `start`, `end`
/// 2. `RampFunc::SINE`:
///    - `freq`
///    - `amplitude`: Default is `1.0`
///    - `offset`: Default is `0.0`
///    - `phase`: Default is `0.0`
/// 3. `RampFunc::EXP`:
///    - `start`, `end`
///    - `tau`: Default is `(t1 - t0) / 3`
#[derive(Clone, PartialEq, Debug)]
pub enum Instruction {
    /// Static set-point, held until the next instruction.
    Const(f64),
    /// Ramp descriptor; expanded on the ramp's own clock at compile time.
    Ramp {
        func: RampFunc,
        t0: f64,
        t1: f64,
        clock_rate: f64,
        args: RampArgs,
    },
    /// Pre-computed `(times, values)` pairs, inserted verbatim.
    Series { times: Vec<f64>, values: Vec<f64> },
}

impl Instruction {
    pub fn new_const(value: f64) -> Instruction {
        Instruction::Const(value)
    }

    /// Linear ramp from `start` to `end` over `[t0, t1]`, sampled at `clock_rate`.
    pub fn new_linear(t0: f64, t1: f64, clock_rate: f64, start: f64, end: f64) -> Instruction {
        Instruction::Ramp {
            func: RampFunc::LINEAR,
            t0,
            t1,
            clock_rate,
            args: hashmap! {"start".to_string() => start, "end".to_string() => end},
        }
    }

    /// Sine modulation over `[t0, t1]`, sampled at `clock_rate`.
    ///
    /// Unspecified optional parameters are not inserted into the argument
    /// dictionary and fall back to their defaults at evaluation time.
    pub fn new_sine(
        t0: f64,
        t1: f64,
        clock_rate: f64,
        freq: f64,
        amplitude: Option<f64>,
        phase: Option<f64>,
        dc_offset: Option<f64>,
    ) -> Instruction {
        let mut args: RampArgs = hashmap! {"freq".to_string() => freq};
        // For each optional argument, if specified, insert into dictionary
        [
            ("amplitude", amplitude),
            ("phase", phase),
            ("offset", dc_offset),
        ]
        .iter()
        .for_each(|(key, opt_value)| {
            if let Some(value) = *opt_value {
                args.insert(key.to_string(), value);
            }
        });
        Instruction::Ramp { func: RampFunc::SINE, t0, t1, clock_rate, args }
    }

    /// Exponential approach from `start` to `end` over `[t0, t1]`.
    pub fn new_exp(t0: f64, t1: f64, clock_rate: f64, start: f64, end: f64, tau: Option<f64>) -> Instruction {
        let mut args: RampArgs =
            hashmap! {"start".to_string() => start, "end".to_string() => end};
        if let Some(tau) = tau {
            args.insert("tau".to_string(), tau);
        }
        Instruction::Ramp { func: RampFunc::EXP, t0, t1, clock_rate, args }
    }

    pub fn new_series(times: Vec<f64>, values: Vec<f64>) -> Instruction {
        Instruction::Series { times, values }
    }

    /// Evaluates a ramp at absolute time `t`.
    fn eval_ramp(func: RampFunc, t0: f64, t1: f64, args: &RampArgs, t: f64) -> f64 {
        match func {
            RampFunc::LINEAR => {
                let start = *args.get("start").unwrap_or(&0.0);
                let end = *args.get("end").unwrap_or(&0.0);
                start + (end - start) * (t - t0) / (t1 - t0)
            }
            RampFunc::SINE => {
                let freq = *args.get("freq").unwrap_or(&0.0);
                let amplitude = *args.get("amplitude").unwrap_or(&1.0);
                let offset = *args.get("offset").unwrap_or(&0.0);
                let phase = *args.get("phase").unwrap_or(&0.0);
                (2.0 * PI * freq * (t - t0) + phase).sin() * amplitude + offset
            }
            RampFunc::EXP => {
                let start = *args.get("start").unwrap_or(&0.0);
                let end = *args.get("end").unwrap_or(&0.0);
                let tau = *args.get("tau").unwrap_or(&((t1 - t0) / 3.0));
                end + (start - end) * (-(t - t0) / tau).exp()
            }
        }
    }

    /// Expands the instruction into `(time, value)` points.
    ///
    /// `t_user` is the time the instruction was placed at. A `Const` yields the
    /// single point `(t_user, value)`. A ramp yields its start point plus
    /// `floor((t1 - t0) * clock_rate)` intermediate points on the ramp's own
    /// clock grid. A series is returned verbatim.
    pub fn expand(&self, t_user: f64) -> Vec<(f64, f64)> {
        match self {
            Instruction::Const(value) => vec![(t_user, *value)],
            Instruction::Ramp { func, t0, t1, clock_rate, args } => {
                let n = ((t1 - t0) * clock_rate).floor() as usize;
                let mut points = Vec::with_capacity(n + 1);
                for i in 0..=n {
                    let t = t0 + i as f64 / clock_rate;
                    points.push((t, Self::eval_ramp(*func, *t0, *t1, args, t)));
                }
                points
            }
            Instruction::Series { times, values } => {
                times.iter().cloned().zip(values.iter().cloned()).collect()
            }
        }
    }

    /// The value the channel holds after this instruction completes.
    pub fn end_value(&self) -> f64 {
        match self {
            Instruction::Const(value) => *value,
            Instruction::Ramp { func, t0, t1, args, .. } => Self::eval_ramp(*func, *t0, *t1, args, *t1),
            Instruction::Series { values, .. } => values.last().cloned().unwrap_or(0.0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::Const(value) => write!(f, "[CONST, {}]", value),
            Instruction::Ramp { func, t0, t1, clock_rate, args } => {
                let args_string = args
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "[{}, {}-{} @ {} Hz, {{{}}}]", func, t0, t1, clock_rate, args_string)
            }
            Instruction::Series { times, .. } => write!(f, "[SERIES, {} points]", times.len()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn const_expansion() {
        let instr = Instruction::new_const(2.5);
        assert_eq!(instr.expand(1.0), vec![(1.0, 2.5)]);
        assert_eq!(instr.end_value(), 2.5);
    }

    #[test]
    fn linear_ramp_expansion() {
        // 1 ms ramp sampled at 10 kHz: 10 intermediate points plus the start
        let instr = Instruction::new_linear(0.0, 1e-3, 1e4, 0.0, 1.0);
        let points = instr.expand(0.0);
        assert_eq!(points.len(), 11);
        assert_eq!(points[0], (0.0, 0.0));
        let (t_last, v_last) = *points.last().unwrap();
        assert!((t_last - 1e-3).abs() < 1e-12);
        assert!((v_last - 1.0).abs() < 1e-12);
        // Midpoint of the linear ramp
        assert!((points[5].1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn series_verbatim() {
        let instr = Instruction::new_series(vec![0.0, 1.0, 2.0], vec![1.0, 2.0, 3.0]);
        assert_eq!(instr.expand(0.0), vec![(0.0, 1.0), (1.0, 2.0), (2.0, 3.0)]);
        assert_eq!(instr.end_value(), 3.0);
    }

    #[test]
    fn sine_defaults_apply_at_evaluation() {
        // amplitude/phase/offset left unspecified: unit sine around zero
        let instr = Instruction::new_sine(0.0, 1.0, 8.0, 1.0, None, None, None);
        let points = instr.expand(0.0);
        assert_eq!(points.len(), 9);
        assert!(points[0].1.abs() < 1e-12);
        // Quarter period peaks at the default amplitude
        assert!((points[2].1 - 1.0).abs() < 1e-12);

        let offset = Instruction::new_sine(0.0, 1.0, 8.0, 1.0, Some(0.5), None, Some(2.0));
        assert!((offset.expand(0.0)[2].1 - 2.5).abs() < 1e-12);
    }

    #[test]
    fn exp_ramp_endpoints() {
        let instr = Instruction::new_exp(0.0, 1.0, 10.0, 1.0, 0.0, Some(0.1));
        let points = instr.expand(0.0);
        assert!((points[0].1 - 1.0).abs() < 1e-12);
        // After 10 time constants the ramp has essentially settled
        assert!(points.last().unwrap().1.abs() < 1e-4);
    }
}
