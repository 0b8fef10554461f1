//! Musical clock and duration resolution.
//!
//! - [`BeatTime`] - Fixed-point beat position
//! - [`TimeSignature`] - Validated time signature (numerator over a power of two)
//! - [`Span`] - A duration as written in a script: a note value or milliseconds
//! - [`Clock`] - Logical time plus a tempo map, so tempo changes only affect
//!   time after the logical instant they were made at
//! - [`TimeMode`] / [`TimeMap`] - How wall-clock ticks map to logical time

use crate::error::{EvalError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point beat representation with 16 fractional bits.
///
/// Avoids floating-point drift in beat positions over long sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BeatTime {
    beats: i64,
}

impl BeatTime {
    const SCALE: i64 = 65_536;

    /// Zero beat time constant.
    pub const ZERO: BeatTime = BeatTime { beats: 0 };

    /// Convert from float beats, rounding to the nearest fixed-point step.
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            beats: (value * Self::SCALE as f64).round() as i64,
        }
    }

    /// Convert to float beats.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.beats as f64 / Self::SCALE as f64
    }
}

impl std::ops::Add for BeatTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_add(rhs.beats),
        }
    }
}

/// Musical time signature (numerator/denominator).
///
/// The numerator is the number of beats per bar; the denominator is the note
/// value of one beat and must be a power of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSignature {
    numerator: u32,
    denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> Result<Self> {
        if numerator == 0 || !denominator.is_power_of_two() {
            return Err(EvalError::InvalidTimeSignature {
                numerator: numerator as f64,
                denominator: denominator as f64,
            });
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Validate a signature given as script numbers.
    ///
    /// Both parts must be positive integers.
    pub fn from_numbers(numerator: f64, denominator: f64) -> Result<Self> {
        let invalid = || EvalError::InvalidTimeSignature {
            numerator,
            denominator,
        };
        let whole = |n: f64| n.is_finite() && n.fract() == 0.0 && n >= 1.0 && n <= u32::MAX as f64;
        if !whole(numerator) || !whole(denominator) {
            return Err(invalid());
        }
        Self::new(numerator as u32, denominator as u32).map_err(|_| invalid())
    }

    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    pub fn denominator(&self) -> u32 {
        self.denominator
    }

    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Note values recognised as duration symbols (`:quarter`, `:bar`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteValue {
    Whole,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
    SixtyFourth,
    /// One beat of the current signature.
    Beat,
    /// One bar of the current signature.
    Bar,
}

impl NoteValue {
    pub fn from_name(name: &str) -> Option<Self> {
        let value = match name {
            "whole" => NoteValue::Whole,
            "half" => NoteValue::Half,
            "quarter" => NoteValue::Quarter,
            "eighth" => NoteValue::Eighth,
            "sixteenth" => NoteValue::Sixteenth,
            "thirtysecond" => NoteValue::ThirtySecond,
            "sixtyfourth" => NoteValue::SixtyFourth,
            "beat" => NoteValue::Beat,
            "bar" => NoteValue::Bar,
            _ => return None,
        };
        Some(value)
    }

    pub fn name(self) -> &'static str {
        match self {
            NoteValue::Whole => "whole",
            NoteValue::Half => "half",
            NoteValue::Quarter => "quarter",
            NoteValue::Eighth => "eighth",
            NoteValue::Sixteenth => "sixteenth",
            NoteValue::ThirtySecond => "thirtysecond",
            NoteValue::SixtyFourth => "sixtyfourth",
            NoteValue::Beat => "beat",
            NoteValue::Bar => "bar",
        }
    }
}

/// A duration before it is resolved against the clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Span {
    Note(NoteValue),
    /// Whole bars of the signature in force, written `:4bars`.
    Bars(u32),
    /// Absolute milliseconds, independent of tempo.
    Millis(f64),
}

impl Span {
    /// Interpret a script value as a duration: a note symbol, a bar count
    /// symbol or a non-negative millisecond count.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(ms) if ms.is_finite() && *ms >= 0.0 => Ok(Span::Millis(*ms)),
            Value::Symbol(name) => Self::from_name(name.as_str())
                .ok_or_else(|| EvalError::InvalidDuration(format!(":{}", name))),
            other => Err(EvalError::InvalidDuration(other.to_string())),
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        if let Some(note) = NoteValue::from_name(name) {
            return Some(Span::Note(note));
        }
        let count = name
            .strip_suffix("bars")
            .or_else(|| name.strip_suffix("bar"))?;
        match count.parse::<u32>() {
            Ok(bars) if bars > 0 => Some(Span::Bars(bars)),
            _ => None,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Span::Note(note) => write!(f, ":{}", note.name()),
            Span::Bars(bars) => write!(f, ":{}bars", bars),
            Span::Millis(ms) => write!(f, "{}ms", ms),
        }
    }
}

/// Tempo in force from `time` on, with the beat position reached there.
#[derive(Clone, Copy, Debug, PartialEq)]
struct TempoPoint {
    time: f64,
    beat: BeatTime,
    bpm: f64,
}

/// Logical clock for one interpreter.
///
/// Logical time is in seconds and never moves backwards. Tempo and
/// signature changes are recorded at the logical time they were made,
/// which may lie behind `now` when a thread catches up inside one tick.
/// Beat positions are resolved against the tempo segment containing the
/// queried time, so a change only affects time after its change point.
#[derive(Clone, Debug)]
pub struct Clock {
    now: f64,
    /// Ordered by time and never empty.
    tempo: Vec<TempoPoint>,
    /// Ordered by time and never empty.
    meter: Vec<(f64, TimeSignature)>,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            now: 0.0,
            tempo: vec![TempoPoint {
                time: 0.0,
                beat: BeatTime::ZERO,
                bpm: 120.0,
            }],
            meter: vec![(0.0, TimeSignature::default())],
        }
    }
}

fn check_tempo(bpm: f64) -> Result<()> {
    if !bpm.is_finite() || bpm <= 0.0 {
        return Err(EvalError::InvalidTempo(bpm));
    }
    Ok(())
}

impl Clock {
    /// Create a clock at logical time zero.
    pub fn new(bpm: f64, signature: TimeSignature) -> Result<Self> {
        check_tempo(bpm)?;
        Ok(Self {
            now: 0.0,
            tempo: vec![TempoPoint {
                time: 0.0,
                beat: BeatTime::ZERO,
                bpm,
            }],
            meter: vec![(0.0, signature)],
        })
    }

    /// Tempo in force now.
    pub fn bpm(&self) -> f64 {
        self.tempo_at(self.now)
    }

    /// Time signature in force now.
    pub fn time_signature(&self) -> TimeSignature {
        self.signature_at(self.now)
    }

    /// Tempo in force at logical time `t`.
    pub fn tempo_at(&self, t: f64) -> f64 {
        self.tempo[self.tempo_index(t)].bpm
    }

    /// Time signature in force at logical time `t`.
    pub fn signature_at(&self, t: f64) -> TimeSignature {
        let index = self
            .meter
            .partition_point(|(time, _)| *time <= t)
            .saturating_sub(1);
        self.meter[index].1
    }

    /// Set the tempo from the current instant on.
    pub fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        self.set_tempo_at(self.now, bpm)
    }

    /// Set the tempo from logical time `t` on.
    ///
    /// Beat positions of later tempo points are recomputed; their tempos
    /// are kept.
    pub fn set_tempo_at(&mut self, t: f64, bpm: f64) -> Result<()> {
        check_tempo(bpm)?;
        let beat = self.beat_at(t);
        let index = self.tempo.partition_point(|point| point.time < t);
        if self.tempo.get(index).is_some_and(|point| point.time == t) {
            self.tempo[index].bpm = bpm;
        } else {
            self.tempo.insert(index, TempoPoint { time: t, beat, bpm });
        }
        for i in index + 1..self.tempo.len() {
            let prev = self.tempo[i - 1];
            let elapsed = self.tempo[i].time - prev.time;
            self.tempo[i].beat = prev.beat + BeatTime::from_float(elapsed * prev.bpm / 60.0);
        }
        log::debug!("[CLOCK] Tempo set to {} BPM at {:.3}s", bpm, t);
        Ok(())
    }

    /// Set the time signature, preserving the current beat position.
    pub fn set_time_signature(&mut self, signature: TimeSignature) {
        self.set_time_signature_at(self.now, signature);
    }

    /// Set the time signature from logical time `t` on.
    pub fn set_time_signature_at(&mut self, t: f64, signature: TimeSignature) {
        let index = self.meter.partition_point(|(time, _)| *time < t);
        if self.meter.get(index).is_some_and(|(time, _)| *time == t) {
            self.meter[index].1 = signature;
        } else {
            self.meter.insert(index, (t, signature));
        }
        log::debug!("[CLOCK] Time signature set to {} at {:.3}s", signature, t);
    }

    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm()
    }

    /// Resolve a duration to seconds at the current tempo.
    pub fn duration_of(&self, span: Span) -> f64 {
        self.duration_at(span, self.now)
    }

    /// Resolve a duration to seconds at the tempo and signature in force at
    /// logical time `t`.
    pub fn duration_at(&self, span: Span, t: f64) -> f64 {
        let beat = 60.0 / self.tempo_at(t);
        let signature = self.signature_at(t);
        let quarter = beat * 4.0 / signature.denominator as f64;
        match span {
            Span::Note(NoteValue::Whole) => quarter * 4.0,
            Span::Note(NoteValue::Half) => quarter * 2.0,
            Span::Note(NoteValue::Quarter) => quarter,
            Span::Note(NoteValue::Eighth) => quarter / 2.0,
            Span::Note(NoteValue::Sixteenth) => quarter / 4.0,
            Span::Note(NoteValue::ThirtySecond) => quarter / 8.0,
            Span::Note(NoteValue::SixtyFourth) => quarter / 16.0,
            Span::Note(NoteValue::Beat) => beat,
            Span::Note(NoteValue::Bar) => beat * signature.beats_per_bar(),
            Span::Bars(bars) => beat * signature.beats_per_bar() * bars as f64,
            Span::Millis(ms) => ms / 1000.0,
        }
    }

    /// Current logical time in seconds.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Move logical time forward to `t`.
    pub fn advance_to(&mut self, t: f64) -> Result<()> {
        if t.is_nan() || t < self.now {
            return Err(EvalError::ClockRegression {
                now: self.now,
                requested: t,
            });
        }
        self.now = t;
        Ok(())
    }

    /// Beat position at logical time `t`.
    pub fn beat_at(&self, t: f64) -> BeatTime {
        let point = self.tempo[self.tempo_index(t)];
        point.beat + BeatTime::from_float((t - point.time) * point.bpm / 60.0)
    }

    pub fn current_beat(&self) -> f64 {
        self.beat_at(self.now).to_float()
    }

    /// Zero-based index of the bar containing the current beat.
    pub fn current_bar(&self) -> u64 {
        (self.current_beat() / self.time_signature().beats_per_bar()).floor() as u64
    }

    /// Drop tempo and signature history that no query at or after `t` can
    /// reach. The segment containing `t` is kept.
    pub fn forget_before(&mut self, t: f64) {
        let keep = self.tempo_index(t);
        self.tempo.drain(..keep);
        let keep = self
            .meter
            .partition_point(|(time, _)| *time <= t)
            .saturating_sub(1);
        self.meter.drain(..keep);
    }

    /// Index of the tempo point in force at `t`; the first point also
    /// covers anything earlier.
    fn tempo_index(&self, t: f64) -> usize {
        self.tempo
            .partition_point(|point| point.time <= t)
            .saturating_sub(1)
    }
}

/// How wall-clock ticks translate into logical time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeMode {
    /// Logical time follows wall time one to one.
    #[default]
    Wall,
    /// Logical time runs `rate` times as fast as wall time.
    Scaled { rate: f64 },
    /// Ticks do not move logical time.
    Paused,
}

impl TimeMode {
    pub fn rate(&self) -> f64 {
        match self {
            TimeMode::Wall => 1.0,
            TimeMode::Scaled { rate } => *rate,
            TimeMode::Paused => 0.0,
        }
    }
}

/// Converts successive wall-clock readings into logical time deltas.
///
/// The first reading only establishes the reference point. A reading older
/// than the previous one yields no advance rather than a regression.
#[derive(Clone, Debug, Default)]
pub struct TimeMap {
    mode: TimeMode,
    last_wall: Option<f64>,
}

impl TimeMap {
    pub fn new(mode: TimeMode) -> Self {
        Self {
            mode,
            last_wall: None,
        }
    }

    pub fn mode(&self) -> TimeMode {
        self.mode
    }

    /// Switch modes; elapsed wall time before the switch keeps the old rate.
    pub fn set_mode(&mut self, mode: TimeMode) {
        self.mode = mode;
    }

    /// Logical seconds elapsed since the previous reading.
    pub fn advance(&mut self, wall: f64) -> f64 {
        let delta = match self.last_wall {
            Some(last) if wall > last => (wall - last) * self.mode.rate(),
            _ => 0.0,
        };
        if self.last_wall.map_or(true, |last| wall > last) {
            self.last_wall = Some(wall);
        }
        delta
    }
}
