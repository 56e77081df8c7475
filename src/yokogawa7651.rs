//! Yokogawa 7651 programmable DC voltage/current source.
//!
//! Read the 7651 instruction manual before driving real hardware: the driver sends what it is told
//! and the instrument will happily source into whatever is connected.
//!
//! | Operation | Command |
//! |---|---|
//! | [`initialize`](Yokogawa7651::initialize) | `RC` |
//! | [`set_voltage_mode`](Yokogawa7651::set_voltage_mode) | `F1R{n}E`, `LA{mA}` |
//! | [`set_current_mode`](Yokogawa7651::set_current_mode) | `F5R{n}E`, `LV{V}` |
//! | [`set_current_limit`](Yokogawa7651::set_current_limit) | `LA{mA}` |
//! | [`set_voltage_limit`](Yokogawa7651::set_voltage_limit) | `LV{V}` |
//! | [`set_output_value`](Yokogawa7651::set_output_value) | `S+{value}E` / `S-{value}E` |
//! | [`set_output_state`](Yokogawa7651::set_output_state) | `O1E` / `O0E` |

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::instrument::Instrument;
use crate::resource::ResourceKind;
use crate::session::Session;
use crate::transport::{Backend, SystemBackend};
use crate::{Error, Result};

/// Program messages are terminated by CR LF
pub const TERMINATOR: &str = "\r\n";

/// Accepted by `LA`, in milliamps
pub const CURRENT_LIMIT_MA: RangeInclusive<f64> = 5.0..=120.0;

/// Accepted by `LV`, in volts
pub const VOLTAGE_LIMIT_V: RangeInclusive<f64> = 0.0..=30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoltageRange {
    Mv10,
    Mv100,
    V1,
    V10,
    V30,
}

impl VoltageRange {
    pub const ALL: [VoltageRange; 5] = [
        VoltageRange::Mv10,
        VoltageRange::Mv100,
        VoltageRange::V1,
        VoltageRange::V10,
        VoltageRange::V30,
    ];

    fn code(self) -> &'static str {
        match self {
            VoltageRange::Mv10 => "R2",
            VoltageRange::Mv100 => "R3",
            VoltageRange::V1 => "R4",
            VoltageRange::V10 => "R5",
            VoltageRange::V30 => "R6",
        }
    }

    pub fn full_scale_mv(self) -> u32 {
        match self {
            VoltageRange::Mv10 => 10,
            VoltageRange::Mv100 => 100,
            VoltageRange::V1 => 1_000,
            VoltageRange::V10 => 10_000,
            VoltageRange::V30 => 30_000,
        }
    }

    /// The range with exactly this full scale
    pub fn from_full_scale_mv(mv: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.full_scale_mv() == mv)
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.full_scale_mv() {
            mv if mv < 1_000 => write!(f, "{mv} mV"),
            mv => write!(f, "{} V", mv / 1_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurrentRange {
    Ma1,
    Ma10,
    Ma100,
}

impl CurrentRange {
    pub const ALL: [CurrentRange; 3] = [CurrentRange::Ma1, CurrentRange::Ma10, CurrentRange::Ma100];

    fn code(self) -> &'static str {
        match self {
            CurrentRange::Ma1 => "R4",
            CurrentRange::Ma10 => "R5",
            CurrentRange::Ma100 => "R6",
        }
    }

    pub fn full_scale_ma(self) -> u32 {
        match self {
            CurrentRange::Ma1 => 1,
            CurrentRange::Ma10 => 10,
            CurrentRange::Ma100 => 100,
        }
    }

    pub fn from_full_scale_ma(ma: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.full_scale_ma() == ma)
    }
}

impl fmt::Display for CurrentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mA", self.full_scale_ma())
    }
}

/// The quantity the source regulates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Unset,
    Voltage,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    Voltage(VoltageRange),
    Current(CurrentRange),
}

/// The compliance limit paired with a mode: a current limit while sourcing voltage, a voltage
/// limit while sourcing current
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Limit {
    Current { milliamps: f64 },
    Voltage { volts: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputState {
    On,
    #[default]
    Off,
}

/// What the driver last commanded. The instrument is never queried, so front panel changes are
/// not reflected here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    pub mode: Mode,
    pub range: Option<Range>,
    pub limit: Option<Limit>,
    pub output_value: Option<f64>,
    pub output: OutputState,
}

/// Format a value the way the 7651 parses it: plain decimal, at most six fractional digits
fn number(value: f64) -> String {
    let s = format!("{:.6}", value.abs());
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if value.is_sign_negative() && s != "0" {
        format!("-{s}")
    } else {
        s.to_string()
    }
}

fn check_limit(what: &str, value: f64, range: &RangeInclusive<f64>, unit: &str) -> Result<()> {
    if !range.contains(&value) {
        return Err(Error::InvalidArgument(format!(
            "{what} {value} {unit} is outside {}..={} {unit}",
            range.start(),
            range.end()
        )));
    }
    Ok(())
}

/// The values a sweep visits, from `start` towards `end` in steps of `step`.
///
/// The sequence includes `end` when it lies on the step grid and never goes past it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
    start: f64,
    end: f64,
    step: f64,
    len: usize,
    next: usize,
}

impl Sweep {
    /// Plan a sweep.
    ///
    /// A negative `step` on a rising sweep is rejected. On a falling sweep the step may be given
    /// either signed or as a magnitude.
    pub fn new(start: f64, end: f64, step: f64) -> Result<Self> {
        if !(start.is_finite() && end.is_finite() && step.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "sweep from {start} to {end} by {step} is not finite"
            )));
        }
        if step == 0.0 {
            return Err(Error::InvalidArgument("sweep step must not be zero".into()));
        }
        if end > start && step < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "sweep from {start} up to {end} cannot step by {step}"
            )));
        }
        let step = if end < start { -step.abs() } else { step.abs() };
        let intervals = (end - start) / step;
        // Tolerate rounding so 0.3 / 0.1 still reaches the end
        let intervals = (intervals + 1e-9 * intervals.max(1.0)).floor();
        if intervals >= usize::MAX as f64 {
            return Err(Error::InvalidArgument(format!(
                "sweep from {start} to {end} by {step} has too many steps"
            )));
        }
        Ok(Self {
            start,
            end,
            step,
            len: intervals as usize + 1,
            next: 0,
        })
    }
}

impl Iterator for Sweep {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.next >= self.len {
            return None;
        }
        let mut value = self.start + self.next as f64 * self.step;
        if (value - self.end).abs() <= self.step.abs() * 1e-9 {
            value = self.end;
        }
        self.next += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.len - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Sweep {}

/// Driver for a Yokogawa 7651.
///
/// Call [`initialize`](Self::initialize) first, then select a mode before setting an output
/// value. Turning the output on with no mode selected is passed through to the instrument.
pub struct Yokogawa7651 {
    session: Session,
    state: SourceState,
}

impl Yokogawa7651 {
    /// Bind to an already open session
    pub fn new(mut session: Session) -> Self {
        session.set_write_terminator(TERMINATOR);
        tracing::info!(session = %session, "Bound Yokogawa 7651");
        Self {
            session,
            state: SourceState::default(),
        }
    }

    pub fn open_with(
        backend: &dyn Backend,
        address: &str,
        kind: ResourceKind,
        config: &SessionConfig,
    ) -> Result<Self> {
        Ok(Self::new(Session::open_with(backend, address, kind, config)?))
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    /// Give the session back without closing it
    pub fn into_session(self) -> Session {
        self.session
    }

    /// Reset every setting of the 7651 to its power-on default
    pub fn initialize(&mut self) -> Result<()> {
        self.session.send("RC")?;
        self.state = SourceState::default();
        Ok(())
    }

    /// Source voltage in `range`, limiting the current to `current_limit_ma` milliamps
    pub fn set_voltage_mode(&mut self, range: VoltageRange, current_limit_ma: f64) -> Result<()> {
        check_limit("current limit", current_limit_ma, &CURRENT_LIMIT_MA, "mA")?;
        self.session.send(&format!("F1{}E", range.code()))?;
        self.state.mode = Mode::Voltage;
        self.state.range = Some(Range::Voltage(range));
        self.state.limit = None;
        self.set_current_limit(current_limit_ma)
    }

    /// Source current in `range`, limiting the voltage to `voltage_limit_v` volts
    pub fn set_current_mode(&mut self, range: CurrentRange, voltage_limit_v: f64) -> Result<()> {
        check_limit("voltage limit", voltage_limit_v, &VOLTAGE_LIMIT_V, "V")?;
        self.session.send(&format!("F5{}E", range.code()))?;
        self.state.mode = Mode::Current;
        self.state.range = Some(Range::Current(range));
        self.state.limit = None;
        self.set_voltage_limit(voltage_limit_v)
    }

    /// Change the current limit while sourcing voltage
    pub fn set_current_limit(&mut self, milliamps: f64) -> Result<()> {
        if self.state.mode != Mode::Voltage {
            return Err(Error::State {
                operation: "set_current_limit",
                reason: "a current limit applies in voltage mode only",
            });
        }
        check_limit("current limit", milliamps, &CURRENT_LIMIT_MA, "mA")?;
        let sent = number(milliamps);
        self.session.send(&format!("LA{sent}"))?;
        self.state.limit = Some(Limit::Current {
            milliamps: sent.parse().unwrap_or(milliamps),
        });
        Ok(())
    }

    /// Change the voltage limit while sourcing current
    pub fn set_voltage_limit(&mut self, volts: f64) -> Result<()> {
        if self.state.mode != Mode::Current {
            return Err(Error::State {
                operation: "set_voltage_limit",
                reason: "a voltage limit applies in current mode only",
            });
        }
        check_limit("voltage limit", volts, &VOLTAGE_LIMIT_V, "V")?;
        let sent = number(volts);
        self.session.send(&format!("LV{sent}"))?;
        self.state.limit = Some(Limit::Voltage {
            volts: sent.parse().unwrap_or(volts),
        });
        Ok(())
    }

    /// Set the output to `value`, in volts or amps depending on the mode.
    ///
    /// The value is not checked against the selected range; the instrument rejects what it
    /// cannot source. It is sent with six decimals, and the state records the rounded value.
    pub fn set_output_value(&mut self, value: f64) -> Result<()> {
        if self.state.mode == Mode::Unset {
            return Err(Error::State {
                operation: "set_output_value",
                reason: "no function selected",
            });
        }
        if !value.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "output value {value} is not finite"
            )));
        }
        let value_str = number(value);
        let command = match value_str.strip_prefix('-') {
            Some(magnitude) => format!("S-{magnitude}E"),
            None => format!("S+{value_str}E"),
        };
        self.session.send(&command)?;
        self.state.output_value = Some(value_str.parse().unwrap_or(value));
        Ok(())
    }

    pub fn set_output_state(&mut self, state: OutputState) -> Result<()> {
        if state == OutputState::On && self.state.mode == Mode::Unset {
            tracing::warn!(session = %self.session, "Output switched on with no function selected");
        }
        self.session.send(match state {
            OutputState::On => "O1E",
            OutputState::Off => "O0E",
        })?;
        self.state.output = state;
        Ok(())
    }

    /// Step the output from `start` to `end`, waiting `delay` between steps.
    ///
    /// Blocks for the whole sweep. Stops at the first failed write, leaving the output at the
    /// last value that was set.
    pub fn sweep(&mut self, start: f64, end: f64, step: f64, delay: Duration) -> Result<()> {
        self.sweep_until(start, end, step, delay, &AtomicBool::new(false))
            .map(|_| ())
    }

    /// Like [`sweep`](Self::sweep), but checks `cancel` right before every write and stops early
    /// once it is set. Returns the number of values that were set.
    pub fn sweep_until(
        &mut self,
        start: f64,
        end: f64,
        step: f64,
        delay: Duration,
        cancel: &AtomicBool,
    ) -> Result<usize> {
        if self.state.mode == Mode::Unset {
            return Err(Error::State {
                operation: "sweep",
                reason: "no function selected",
            });
        }
        let sweep = Sweep::new(start, end, step)?;
        tracing::debug!(start, end, step, steps = sweep.len(), "Sweeping output");
        let mut done = 0;
        for value in sweep {
            if done > 0 && !delay.is_zero() {
                thread::sleep(delay);
            }
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(done, "Sweep cancelled");
                break;
            }
            self.set_output_value(value)?;
            done += 1;
        }
        Ok(done)
    }

    /// Select voltage mode and sweep the output voltage
    pub fn voltage_sweep(
        &mut self,
        range: VoltageRange,
        current_limit_ma: f64,
        start: f64,
        end: f64,
        step: f64,
        delay: Duration,
    ) -> Result<()> {
        Sweep::new(start, end, step)?;
        self.set_voltage_mode(range, current_limit_ma)?;
        self.sweep(start, end, step, delay)
    }
}

impl Instrument for Yokogawa7651 {
    fn open(address: &str, kind: ResourceKind) -> Result<Self> {
        Self::open_with(&SystemBackend, address, kind, &SessionConfig::default())
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::mock::MockBackend;
    use tracing_test::traced_test;

    fn source() -> (Yokogawa7651, MockBackend) {
        let backend = MockBackend::new();
        let source = Yokogawa7651::open_with(
            &backend,
            "GPIB0::1::INSTR",
            ResourceKind::Gpib,
            &SessionConfig::default(),
        )
        .unwrap();
        (source, backend)
    }

    #[test]
    fn test_number_format() {
        assert_eq!(number(3.0), "3");
        assert_eq!(number(20.0), "20");
        assert_eq!(number(100.0), "100");
        assert_eq!(number(0.0), "0");
        assert_eq!(number(-0.0), "0");
        assert_eq!(number(-2.5), "-2.5");
        assert_eq!(number(0.1 + 0.2), "0.3");
        assert_eq!(number(1.2345678), "1.234568");
    }

    #[test]
    fn test_initialize() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        source.set_output_state(OutputState::On).unwrap();
        source.initialize().unwrap();
        assert_eq!(backend.commands().last().unwrap(), "RC");
        assert_eq!(source.state(), &SourceState::default());
    }

    #[test]
    fn test_voltage_mode_commands() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        assert_eq!(backend.commands(), ["F1R5E", "LA20"]);
        assert_eq!(backend.written()[0], b"F1R5E\r\n");
        assert_eq!(source.mode(), Mode::Voltage);
        assert_eq!(
            source.state().range,
            Some(Range::Voltage(VoltageRange::V10))
        );
        assert_eq!(
            source.state().limit,
            Some(Limit::Current { milliamps: 20.0 })
        );
    }

    #[test]
    fn test_current_mode_commands() {
        let (mut source, backend) = source();
        source.set_current_mode(CurrentRange::Ma1, 12.5).unwrap();
        assert_eq!(backend.commands(), ["F5R4E", "LV12.5"]);
        assert_eq!(source.mode(), Mode::Current);
        assert_eq!(source.state().limit, Some(Limit::Voltage { volts: 12.5 }));
    }

    #[test]
    fn test_latest_mode_wins() {
        let (mut source, _backend) = source();
        source.set_voltage_mode(VoltageRange::V1, 10.0).unwrap();
        source.set_current_mode(CurrentRange::Ma10, 5.0).unwrap();
        source.set_voltage_mode(VoltageRange::V30, 50.0).unwrap();
        assert_eq!(source.mode(), Mode::Voltage);
        assert_eq!(
            source.state().limit,
            Some(Limit::Current { milliamps: 50.0 })
        );
        assert_eq!(
            source.state().range,
            Some(Range::Voltage(VoltageRange::V30))
        );
    }

    #[test]
    fn test_limits_checked_before_sending() {
        let (mut source, backend) = source();
        assert!(matches!(
            source.set_voltage_mode(VoltageRange::V10, 150.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            source.set_current_mode(CurrentRange::Ma10, 30.5),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            source.set_current_mode(CurrentRange::Ma10, -0.5),
            Err(Error::InvalidArgument(_))
        ));
        assert!(backend.written().is_empty());
        assert_eq!(source.mode(), Mode::Unset);

        source.set_current_mode(CurrentRange::Ma10, 0.5).unwrap();
        source.set_current_mode(CurrentRange::Ma10, 0.0).unwrap();
        assert_eq!(backend.commands(), ["F5R5E", "LV0.5", "F5R5E", "LV0"]);
    }

    #[test]
    fn test_limit_follows_the_mode() {
        let (mut source, backend) = source();
        assert!(matches!(
            source.set_current_limit(50.0),
            Err(Error::State { .. })
        ));
        assert!(matches!(
            source.set_voltage_limit(10.0),
            Err(Error::State { .. })
        ));

        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        source.set_current_limit(75.0).unwrap();
        assert_eq!(
            source.state().limit,
            Some(Limit::Current { milliamps: 75.0 })
        );
        assert!(matches!(
            source.set_voltage_limit(10.0),
            Err(Error::State { .. })
        ));
        assert!(matches!(
            source.set_current_limit(121.0),
            Err(Error::InvalidArgument(_))
        ));

        source.set_current_mode(CurrentRange::Ma100, 5.0).unwrap();
        source.set_voltage_limit(12.0).unwrap();
        assert_eq!(source.state().limit, Some(Limit::Voltage { volts: 12.0 }));
        assert!(matches!(
            source.set_current_limit(50.0),
            Err(Error::State { .. })
        ));
        assert_eq!(
            backend.commands(),
            ["LA75", "F5R6E", "LV5", "LV12"]
        );
        assert_eq!(
            source.state().range,
            Some(Range::Current(CurrentRange::Ma100))
        );
    }

    #[test]
    fn test_output_value_needs_mode() {
        let (mut source, backend) = source();
        let err = source.set_output_value(1.0).unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                operation: "set_output_value",
                ..
            }
        ));
        assert!(backend.written().is_empty());
    }

    #[test]
    fn test_output_value_sign() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        source.set_output_value(3.0).unwrap();
        source.set_output_value(-1.25).unwrap();
        source.set_output_value(0.0).unwrap();
        assert_eq!(backend.commands(), ["S+3E", "S-1.25E", "S+0E"]);
        assert_eq!(source.state().output_value, Some(0.0));
    }

    #[test]
    fn test_output_value_records_what_was_sent() {
        let (mut source, backend) = source();
        source.set_current_mode(CurrentRange::Ma1, 5.0).unwrap();
        backend.clear();
        source.set_output_value(1e-7).unwrap();
        assert_eq!(source.state().output_value, Some(0.0));
        source.set_output_value(-0.00012345678).unwrap();
        assert_eq!(source.state().output_value, Some(-0.000123));
        assert_eq!(backend.commands(), ["S+0E", "S-0.000123E"]);
    }

    #[test]
    fn test_output_state() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        source.set_output_state(OutputState::On).unwrap();
        assert_eq!(source.state().output, OutputState::On);
        source.set_output_state(OutputState::Off).unwrap();
        assert_eq!(source.state().output, OutputState::Off);
        assert_eq!(backend.commands(), ["O1E", "O0E"]);
    }

    #[traced_test]
    #[test]
    fn test_output_on_without_mode_is_passed_through() {
        let (mut source, backend) = source();
        source.set_output_state(OutputState::On).unwrap();
        assert_eq!(backend.commands(), ["O1E"]);
        assert!(logs_contain("Output switched on with no function selected"));
    }

    #[test]
    fn test_sweep_up() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        source.sweep(0.0, 10.0, 2.0, Duration::ZERO).unwrap();
        assert_eq!(
            backend.commands(),
            ["S+0E", "S+2E", "S+4E", "S+6E", "S+8E", "S+10E"]
        );
        assert_eq!(source.state().output_value, Some(10.0));
    }

    #[test]
    fn test_sweep_down() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        source.sweep(10.0, 0.0, 2.0, Duration::ZERO).unwrap();
        assert_eq!(
            backend.commands(),
            ["S+10E", "S+8E", "S+6E", "S+4E", "S+2E", "S+0E"]
        );
    }

    #[test]
    fn test_sweep_rejects_bad_steps() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        for (start, end, step) in [
            (0.0, 10.0, -1.0),
            (0.0, 10.0, 0.0),
            (0.0, f64::NAN, 1.0),
        ] {
            assert!(matches!(
                source.sweep(start, end, step, Duration::ZERO),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(backend.written().is_empty());
    }

    #[test]
    fn test_sweep_needs_mode() {
        let (mut source, _backend) = source();
        assert!(matches!(
            source.sweep(0.0, 1.0, 0.1, Duration::ZERO),
            Err(Error::State { .. })
        ));
    }

    #[test]
    fn test_sweep_cancel() {
        let (mut source, backend) = source();
        source.set_current_mode(CurrentRange::Ma10, 5.0).unwrap();
        backend.clear();
        let cancel = AtomicBool::new(true);
        let done = source
            .sweep_until(0.0, 0.005, 0.001, Duration::ZERO, &cancel)
            .unwrap();
        assert_eq!(done, 0);
        assert!(backend.written().is_empty());
    }

    #[test]
    fn test_sweep_cancelled_during_delay() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.clear();
        let cancel = AtomicBool::new(false);
        let done = thread::scope(|s| {
            let watcher = backend.clone();
            let cancel = &cancel;
            s.spawn(move || {
                while watcher.written().len() < 2 {
                    thread::sleep(Duration::from_millis(1));
                }
                cancel.store(true, Ordering::Relaxed);
            });
            source
                .sweep_until(0.0, 10.0, 1.0, Duration::from_millis(200), cancel)
                .unwrap()
        });
        assert_eq!(done, 2);
        assert_eq!(backend.commands(), ["S+0E", "S+1E"]);
        assert_eq!(source.state().output_value, Some(1.0));
    }

    #[test]
    fn test_sweep_stops_on_write_failure() {
        let (mut source, backend) = source();
        source.set_voltage_mode(VoltageRange::V10, 20.0).unwrap();
        backend.fail_writes();
        assert!(matches!(
            source.sweep(0.0, 1.0, 0.5, Duration::ZERO),
            Err(Error::Io { .. })
        ));
        assert_eq!(source.state().output_value, None);
    }

    #[test]
    fn test_sweep_plan() {
        let values: Vec<f64> = Sweep::new(0.0, 0.3, 0.1).unwrap().collect();
        assert_eq!(values.len(), 4);
        assert_eq!(values[3], 0.3);
        let values: Vec<f64> = Sweep::new(1.0, 0.0, -0.4).unwrap().collect();
        assert_eq!(values.len(), 3);
        assert!((values[2] - 0.2).abs() < 1e-12);
        assert_eq!(Sweep::new(2.0, 2.0, 1.0).unwrap().collect::<Vec<_>>(), [2.0]);
        assert_eq!(Sweep::new(0.0, 10.0, 3.0).unwrap().len(), 4);
    }

    #[test]
    fn test_voltage_sweep() {
        let (mut source, backend) = source();
        source
            .voltage_sweep(VoltageRange::V1, 10.0, 0.0, 0.5, 0.25, Duration::ZERO)
            .unwrap();
        assert_eq!(
            backend.commands(),
            ["F1R4E", "LA10", "S+0E", "S+0.25E", "S+0.5E"]
        );
    }

    #[test]
    fn test_ranges() {
        let names: Vec<String> = VoltageRange::ALL.iter().map(|r| r.to_string()).collect();
        assert_eq!(names, ["10 mV", "100 mV", "1 V", "10 V", "30 V"]);
        let names: Vec<String> = CurrentRange::ALL.iter().map(|r| r.to_string()).collect();
        assert_eq!(names, ["1 mA", "10 mA", "100 mA"]);
        assert_eq!(
            VoltageRange::from_full_scale_mv(10_000),
            Some(VoltageRange::V10)
        );
        assert_eq!(CurrentRange::from_full_scale_ma(100), Some(CurrentRange::Ma100));
        assert_eq!(CurrentRange::from_full_scale_ma(2), None);
    }

    #[test]
    fn test_describe_and_close() {
        let (mut source, backend) = source();
        assert_eq!(source.describe(), "GPIB GPIB0::1::INSTR");
        source.close().unwrap();
        source.close().unwrap();
        assert_eq!(backend.closes(), 1);
        assert!(matches!(source.initialize(), Err(Error::Io { .. })));
    }
}
