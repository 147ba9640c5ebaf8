//! Collaborator interfaces at the hardware and storage edges
//!
//! The core never touches pins, buses or files directly. Each node is handed
//! implementations of these traits at construction time.

use std::fmt;

use crate::{GateResult, Lamps};

/// Distance sensor
///
/// `measure` blocks for at most the sensor's echo timeout (about 30 ms for
/// an HC-SR04) and cannot be cancelled mid-flight. A non-positive value
/// means no echo was received.
pub trait DistanceSource {
    fn measure(&mut self) -> f64;
}

impl<S: DistanceSource + ?Sized> DistanceSource for &mut S {
    fn measure(&mut self) -> f64 {
        (**self).measure()
    }
}

impl<S: DistanceSource + ?Sized> DistanceSource for Box<S> {
    fn measure(&mut self) -> f64 {
        (**self).measure()
    }
}

/// Three-lamp signal
pub trait SignalIndicator {
    fn set_signal(&mut self, lamps: Lamps);
}

impl<S: SignalIndicator + ?Sized> SignalIndicator for Box<S> {
    fn set_signal(&mut self, lamps: Lamps) {
        (**self).set_signal(lamps)
    }
}

/// Maximum number of lines a status display shows
pub const DISPLAY_LINES: usize = 4;

/// Status text display; drivers pass at most [`DISPLAY_LINES`] lines
pub trait DisplayOutput {
    fn show(&mut self, lines: &[String]);
}

impl<D: DisplayOutput + ?Sized> DisplayOutput for Box<D> {
    fn show(&mut self, lines: &[String]) {
        (**self).show(lines)
    }
}

/// Link state as written to the measurement log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Ok,
    NoClient,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Ok => write!(f, "OK"),
            LinkStatus::NoClient => write!(f, "NO_CLIENT"),
        }
    }
}

/// One completed timing cycle
#[derive(Clone, Debug, PartialEq)]
pub struct TimingRecord {
    /// Controller-local time the result arrived
    pub timestamp_ms: u64,
    /// Elapsed time reported by the timer node
    pub elapsed_ms: u64,
    pub link_status: LinkStatus,
    /// Controller reference distance at the time (cm)
    pub reference_distance: f64,
}

/// Append-only store for completed cycles
pub trait LogSink {
    fn append(&mut self, record: &TimingRecord) -> GateResult<()>;
}

impl<L: LogSink + ?Sized> LogSink for Box<L> {
    fn append(&mut self, record: &TimingRecord) -> GateResult<()> {
        (**self).append(record)
    }
}
