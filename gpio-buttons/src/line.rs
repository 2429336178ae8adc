//! The interface consumed from the hardware access layer.
//!
//! A [LineProvider] resolves a human readable identifier to a [LineHandle].
//! Hardware libraries deliver edges in one of two ways, so a handle is either
//! [Polled](LineHandle::Polled), with a blocking [PollLine::wait_for_edge], or
//! [Evented](LineHandle::Evented), where the hardware layer calls a handler
//! installed with [EventLine::subscribe] on its own thread.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Passive resistor configuration requested from the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bias {
    /// Leave whatever the platform configured.
    AsIs,
    PullUp,
    PullDown,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeMode {
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    /// If an edge that leaves the line at `level` is reported in this mode.
    pub fn matches(self, level: Level) -> bool {
        match self {
            EdgeMode::Both => true,
            EdgeMode::Rising => level == Level::High,
            EdgeMode::Falling => level == Level::Low,
        }
    }
}

/// Everything [Line::configure] applies in one request. The line is always
/// configured as an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSettings {
    pub bias: Bias,
    pub edge: EdgeMode,
    /// Hardware (kernel) debounce period, if requested.
    pub debounce: Option<Duration>,
}

/// Result of a single [PollLine::wait_for_edge] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An edge occurred. The timestamp is monotonic and relative to an
    /// arbitrary per-line origin.
    Edge(Duration),
    Timeout,
}

/// An edge pushed to an [EdgeHandler].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeEvent {
    pub timestamp: Duration,
    /// Level of the line right after the edge.
    pub level: Level,
}

pub type EdgeHandler = Box<dyn FnMut(EdgeEvent) + Send + 'static>;

/// Hardware features a line may lack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    Input,
    Bias,
    Debounce,
    EdgeDetection,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Feature::Input => "input mode",
            Feature::Bias => "bias configuration",
            Feature::Debounce => "hardware debounce",
            Feature::EdgeDetection => "edge detection",
        })
    }
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line {0:?} not found")]
    NotFound(String),
    #[error("line is already in use")]
    Busy,
    #[error("line does not support {0}")]
    Unsupported(Feature),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed to read line level: {0}")]
    Read(String),
    #[error("line was released")]
    Released,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl LineError {
    /// Errors after which waiting on the line again can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LineError::Released | LineError::NotFound(_) | LineError::PermissionDenied(_)
        )
    }
}

/// Operations shared by both delivery models.
pub trait Line: Send {
    /// Configure the line as an input with the given settings. A rejected
    /// request must leave the line open so a weaker request can follow.
    fn configure(&mut self, settings: &LineSettings) -> Result<(), LineError>;

    fn read_level(&mut self) -> Result<Level, LineError>;

    /// Give the line back to the system. Calling it again is a no-op.
    fn release(&mut self) -> Result<(), LineError>;
}

pub trait PollLine: Line {
    /// Block until an edge arrives or `timeout` elapses.
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<WaitOutcome, LineError>;
}

pub trait EventLine: Line {
    /// Install `handler`, replacing any previous one. It stays installed until
    /// the line is released.
    fn subscribe(&mut self, handler: EdgeHandler) -> Result<(), LineError>;
}

/// An opened line in whichever delivery model its backend provides.
pub enum LineHandle {
    Polled(Box<dyn PollLine>),
    Evented(Box<dyn EventLine>),
}

impl LineHandle {
    pub fn configure(&mut self, settings: &LineSettings) -> Result<(), LineError> {
        match self {
            LineHandle::Polled(line) => line.configure(settings),
            LineHandle::Evented(line) => line.configure(settings),
        }
    }

    pub fn read_level(&mut self) -> Result<Level, LineError> {
        match self {
            LineHandle::Polled(line) => line.read_level(),
            LineHandle::Evented(line) => line.read_level(),
        }
    }

    pub fn release(&mut self) -> Result<(), LineError> {
        match self {
            LineHandle::Polled(line) => line.release(),
            LineHandle::Evented(line) => line.release(),
        }
    }

    /// Edge mode to request for a button of the given polarity. Polled lines
    /// watch both edges so release edges are consumed and never stall the
    /// wait, evented lines only need the press edge.
    pub fn press_edges(&self, active_low: bool) -> EdgeMode {
        match self {
            LineHandle::Polled(_) => EdgeMode::Both,
            LineHandle::Evented(_) if active_low => EdgeMode::Falling,
            LineHandle::Evented(_) => EdgeMode::Rising,
        }
    }
}

impl fmt::Debug for LineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineHandle::Polled(_) => f.write_str("LineHandle::Polled"),
            LineHandle::Evented(_) => f.write_str("LineHandle::Evented"),
        }
    }
}

/// Resolves identifiers to hardware lines.
pub trait LineProvider: Send {
    fn open(&self, identifier: &str) -> Result<LineHandle, LineError>;
}

/// If `level` means "pressed" for a button of the given polarity.
pub fn is_pressed(level: Level, active_low: bool) -> bool {
    (level == Level::Low) == active_low
}
