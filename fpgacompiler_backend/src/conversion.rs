//! User-unit to hardware-unit conversion.
//!
//! A conversion is defined by a calibration equation in one variable `x`
//! (the user-unit value) evaluating to the base unit (volts). The equation is
//! parsed once into a small AST; there is no runtime code evaluation.
//!
//! The inverse direction (`from_base`) has no closed form in general and the
//! calibration equations are not guaranteed to be monotonic, so it is solved
//! numerically: a bracketed Newton iteration seeded from a pre-computed
//! `(x, y)` sampling of the equation across `[min, max]`, with a secant
//! fallback for points where the derivative vanishes.

use crate::errors::ConversionError;

const NEWTON_MAX_ITER: usize = 100;
const SECANT_MAX_ITER: usize = 200;
/// Number of seed points sampled across the user range for the inverse.
const SAMPLE_POINTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryFn {
    Neg,
    Sqrt,
    Log,
    Exp,
    Sin,
    Cos,
    Tan,
    Abs,
    Sign,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Var,
    Unary(UnaryFn, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, x: f64) -> f64 {
        match self {
            Expr::Num(v) => *v,
            Expr::Var => x,
            Expr::Unary(f, a) => {
                let a = a.eval(x);
                match f {
                    UnaryFn::Neg => -a,
                    UnaryFn::Sqrt => a.sqrt(),
                    UnaryFn::Log => a.ln(),
                    UnaryFn::Exp => a.exp(),
                    UnaryFn::Sin => a.sin(),
                    UnaryFn::Cos => a.cos(),
                    UnaryFn::Tan => a.tan(),
                    UnaryFn::Abs => a.abs(),
                    UnaryFn::Sign => {
                        if a > 0.0 {
                            1.0
                        } else if a < 0.0 {
                            -1.0
                        } else {
                            0.0
                        }
                    }
                }
            }
            Expr::Binary(op, a, b) => {
                let a = a.eval(x);
                let b = b.eval(x);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Pow => a.powf(b),
                }
            }
        }
    }
}

/// Recursive-descent parser over the calibration expression grammar:
/// `expr := term (('+'|'-') term)*`, `term := factor (('*'|'/') factor)*`,
/// `factor := unary ('^' factor)?`, `unary := '-' unary | atom`,
/// `atom := number | 'x' | func '(' expr ')' | '(' expr ')'`.
struct Parser<'a> {
    equation: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(equation: &'a str) -> Self {
        Self { equation, chars: equation.chars().collect(), pos: 0 }
    }

    fn err(&self, msg: &str) -> ConversionError {
        ConversionError::Parse {
            equation: self.equation.to_string(),
            pos: self.pos,
            msg: msg.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn accept(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> Result<Expr, ConversionError> {
        let expr = self.expr()?;
        self.skip_ws();
        if self.pos != self.chars.len() {
            return Err(self.err("trailing characters"));
        }
        Ok(expr)
    }

    fn expr(&mut self) -> Result<Expr, ConversionError> {
        let mut lhs = self.term()?;
        loop {
            if self.accept('+') {
                let rhs = self.term()?;
                lhs = Expr::Binary(BinOp::Add, Box::new(lhs), Box::new(rhs));
            } else if self.accept('-') {
                let rhs = self.term()?;
                lhs = Expr::Binary(BinOp::Sub, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn term(&mut self) -> Result<Expr, ConversionError> {
        let mut lhs = self.factor()?;
        loop {
            if self.accept('*') {
                let rhs = self.factor()?;
                lhs = Expr::Binary(BinOp::Mul, Box::new(lhs), Box::new(rhs));
            } else if self.accept('/') {
                let rhs = self.factor()?;
                lhs = Expr::Binary(BinOp::Div, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, ConversionError> {
        let base = self.unary()?;
        if self.accept('^') {
            // Right-associative
            let exp = self.factor()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, ConversionError> {
        if self.accept('-') {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryFn::Neg, Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, ConversionError> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.expr()?;
                if !self.accept(')') {
                    return Err(self.err("expected ')'"));
                }
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.ident(),
            _ => Err(self.err("expected number, 'x', function or '('")),
        }
    }

    fn number(&mut self) -> Result<Expr, ConversionError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else if (c == 'e' || c == 'E') && self.pos > start {
                self.pos += 1;
                if matches!(self.chars.get(self.pos), Some('+') | Some('-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Expr::Num)
            .map_err(|_| self.err("malformed number"))
    }

    fn ident(&mut self) -> Result<Expr, ConversionError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_alphanumeric() {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if name == "x" {
            return Ok(Expr::Var);
        }
        let func = match name.as_str() {
            "sqrt" => UnaryFn::Sqrt,
            "log" => UnaryFn::Log,
            "exp" => UnaryFn::Exp,
            "sin" => UnaryFn::Sin,
            "cos" => UnaryFn::Cos,
            "tan" => UnaryFn::Tan,
            "abs" => UnaryFn::Abs,
            "sign" => UnaryFn::Sign,
            _ => return Err(self.err("unknown identifier")),
        };
        if !self.accept('(') {
            return Err(self.err("expected '(' after function name"));
        }
        let arg = self.expr()?;
        if !self.accept(')') {
            return Err(self.err("expected ')'"));
        }
        Ok(Expr::Unary(func, Box::new(arg)))
    }
}

/// A calibrated unit conversion for one analog channel.
///
/// `to_base` evaluates the calibration equation; `from_base` inverts it
/// numerically within the user range `[min, max]`.
#[derive(Debug, Clone)]
pub struct UnitConversion {
    equation: String,
    expr: Expr,
    min: f64,
    max: f64,
    decimals: i32,
    /// `(x, y)` sampling across `[min, max]`, sorted by `y`; seeds the inverse.
    samples: Vec<(f64, f64)>,
}

impl UnitConversion {
    /// Parses `equation` and pre-computes the inverse seed table.
    ///
    /// `decimals` is the display precision of the user unit; the inverse is
    /// solved to tolerance `10^-(decimals + 2)`.
    pub fn new(equation: &str, min: f64, max: f64, decimals: i32) -> Result<Self, ConversionError> {
        let expr = Parser::new(equation).parse()?;
        let mut samples: Vec<(f64, f64)> = (0..SAMPLE_POINTS)
            .map(|i| {
                let x = min + (max - min) * i as f64 / (SAMPLE_POINTS - 1) as f64;
                (x, expr.eval(x))
            })
            .filter(|(_, y)| y.is_finite())
            .collect();
        samples.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        Ok(Self { equation: equation.to_string(), expr, min, max, decimals, samples })
    }

    /// Identity conversion over the given range.
    pub fn identity(min: f64, max: f64) -> Self {
        Self::new("x", min, max, 6).unwrap()
    }

    pub fn equation(&self) -> &str {
        &self.equation
    }
    pub fn min(&self) -> f64 {
        self.min
    }
    pub fn max(&self) -> f64 {
        self.max
    }

    fn tolerance(&self) -> f64 {
        10f64.powi(-(self.decimals + 2))
    }

    /// User units to base units (volts).
    pub fn to_base(&self, user_value: f64) -> Result<f64, ConversionError> {
        let y = self.expr.eval(user_value);
        if !y.is_finite() {
            return Err(ConversionError::NotFinite {
                equation: self.equation.clone(),
                value: user_value,
            });
        }
        Ok(y)
    }

    fn derivative(&self, x: f64) -> f64 {
        // Central difference on a scale-aware step
        let h = 1e-6 * (self.max - self.min).abs().max(1.0);
        (self.expr.eval(x + h) - self.expr.eval(x - h)) / (2.0 * h)
    }

    /// Base units (volts) back to user units.
    ///
    /// Newton iteration started from the sampled point whose `y` is closest to
    /// the target; additional starting points from the seed table are tried on
    /// failure, then the secant fallback.
    pub fn from_base(&self, base_value: f64) -> Result<f64, ConversionError> {
        let no_convergence = || ConversionError::NoConvergence {
            equation: self.equation.clone(),
            value: base_value,
        };
        if self.samples.is_empty() {
            return Err(no_convergence());
        }

        // Seeds ordered by |y - target|
        let mut seeds: Vec<(f64, f64)> = self.samples.clone();
        seeds.sort_by(|a, b| {
            (a.1 - base_value)
                .abs()
                .partial_cmp(&(b.1 - base_value).abs())
                .unwrap()
        });

        for &(x0, _) in seeds.iter().take(8) {
            if let Some(x) = self.newton(x0, base_value) {
                return Ok(x);
            }
        }
        for &(x0, _) in seeds.iter().take(8) {
            if let Some(x) = self.secant(x0, base_value) {
                return Ok(x);
            }
        }
        Err(no_convergence())
    }

    fn clamp_to_range(&self, x: f64) -> f64 {
        x.clamp(self.min.min(self.max), self.min.max(self.max))
    }

    fn newton(&self, mut x: f64, target: f64) -> Option<f64> {
        let tol = self.tolerance();
        for _ in 0..NEWTON_MAX_ITER {
            let f = self.expr.eval(x) - target;
            if !f.is_finite() {
                return None;
            }
            if f.abs() < tol {
                return Some(x);
            }
            let df = self.derivative(x);
            if !df.is_finite() || df.abs() < f64::EPSILON {
                return None;
            }
            // Keep the iterate bracketed inside the calibrated range
            x = self.clamp_to_range(x - f / df);
        }
        None
    }

    fn secant(&self, x0: f64, target: f64) -> Option<f64> {
        let tol = self.tolerance();
        let mut a = x0;
        let mut b = self.clamp_to_range(x0 + 1e-3 * (self.max - self.min).abs().max(1.0));
        if a == b {
            b = self.clamp_to_range(x0 - 1e-3 * (self.max - self.min).abs().max(1.0));
        }
        let mut fa = self.expr.eval(a) - target;
        let mut fb = self.expr.eval(b) - target;
        for _ in 0..SECANT_MAX_ITER {
            if !fb.is_finite() {
                return None;
            }
            if fb.abs() < tol {
                return Some(b);
            }
            let denom = fb - fa;
            if denom.abs() < f64::EPSILON {
                return None;
            }
            let next = self.clamp_to_range(b - fb * (b - a) / denom);
            a = b;
            fa = fb;
            b = next;
            fb = self.expr.eval(b) - target;
        }
        None
    }
}
