//! In-memory GPIO lines.
//!
//! A [SimChip] is a [LineProvider] whose lines are driven through [SimPin]
//! handles: inject edges with explicit timestamps, make reads or waits fail,
//! and inspect how the line was configured and how often it was released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::line::{
    Bias, EdgeEvent, EdgeHandler, EventLine, Feature, Level, Line, LineError, LineHandle,
    LineProvider, LineSettings, PollLine, WaitOutcome,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    #[default]
    Poll,
    Event,
}

/// What a simulated line supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub input: bool,
    pub bias: bool,
    pub debounce: bool,
    pub delivery: Delivery,
    /// Claimed by another consumer, opening it fails.
    pub busy: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            input: true,
            bias: true,
            debounce: false,
            delivery: Delivery::Poll,
            busy: false,
        }
    }
}

impl Capabilities {
    /// A line without bias or hardware debounce.
    pub fn bare_input() -> Self {
        Self {
            bias: false,
            debounce: false,
            ..Self::default()
        }
    }
}

#[derive(Clone, Default)]
pub struct SimChip {
    lines: Arc<Mutex<HashMap<String, SimPin>>>,
}

impl SimChip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a line, or replace the one with the same name.
    pub fn add_line(&self, name: impl Into<String>, capabilities: Capabilities) -> SimPin {
        let name = name.into();
        let pin = SimPin {
            inner: Arc::new(PinInner {
                name: name.clone(),
                capabilities,
                state: Mutex::new(PinState::default()),
                edges: Condvar::new(),
                handler: Mutex::new(None),
            }),
        };
        lock(&self.lines).insert(name, pin.clone());
        pin
    }
}

impl LineProvider for SimChip {
    fn open(&self, identifier: &str) -> Result<LineHandle, LineError> {
        let pin = lock(&self.lines)
            .get(identifier)
            .cloned()
            .ok_or_else(|| LineError::NotFound(identifier.to_owned()))?;
        if pin.inner.capabilities.busy {
            return Err(LineError::Busy);
        }
        {
            let mut state = pin.state();
            if state.claimed {
                return Err(LineError::Busy);
            }
            state.claimed = true;
            state.unplugged = false;
        }

        let delivery = pin.inner.capabilities.delivery;
        let line = SimLine {
            pin,
            released: false,
        };
        Ok(match delivery {
            Delivery::Poll => LineHandle::Polled(Box::new(line)),
            Delivery::Event => LineHandle::Evented(Box::new(line)),
        })
    }
}

struct PinInner {
    name: String,
    capabilities: Capabilities,
    state: Mutex<PinState>,
    edges: Condvar,
    handler: Mutex<Option<EdgeHandler>>,
}

struct PinState {
    level: Level,
    claimed: bool,
    unplugged: bool,
    settings: Option<LineSettings>,
    pending: VecDeque<EdgeEvent>,
    last_delivered: Option<Duration>,
    failing_reads: usize,
    failing_waits: usize,
    releases: usize,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            level: Level::High,
            claimed: false,
            unplugged: false,
            settings: None,
            pending: VecDeque::new(),
            last_delivered: None,
            failing_reads: 0,
            failing_waits: 0,
            releases: 0,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test side of a simulated line.
#[derive(Clone)]
pub struct SimPin {
    inner: Arc<PinInner>,
}

impl SimPin {
    fn state(&self) -> MutexGuard<'_, PinState> {
        lock(&self.inner.state)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Drive the line to `level` at `at`. The edge is only reported while the
    /// line is claimed and configured, and only if it matches the configured
    /// edge mode and passes the hardware debounce.
    pub fn edge(&self, level: Level, at: Duration) {
        let mut state = self.state();
        let Some(settings) = state.settings.filter(|_| state.claimed) else {
            state.level = level;
            return;
        };

        let bounced = match (settings.debounce, state.last_delivered) {
            (Some(period), Some(previous)) => at.saturating_sub(previous) < period,
            _ => false,
        };
        if !settings.edge.matches(level) || bounced {
            if state.pending.is_empty() {
                state.level = level;
            }
            return;
        }
        state.last_delivered = Some(at);

        let event = EdgeEvent {
            timestamp: at,
            level,
        };
        match self.inner.capabilities.delivery {
            Delivery::Poll => {
                state.pending.push_back(event);
                self.inner.edges.notify_all();
            }
            Delivery::Event => {
                state.level = level;
                drop(state);
                if let Some(handler) = lock(&self.inner.handler).as_mut() {
                    handler(event);
                }
            }
        }
    }

    /// Change the level without reporting an edge.
    pub fn set_level(&self, level: Level) {
        self.state().level = level;
    }

    /// Make the next `count` level reads fail.
    pub fn fail_reads(&self, count: usize) {
        self.state().failing_reads = count;
    }

    /// Make the next `count` edge waits fail with a transient error.
    pub fn fail_waits(&self, count: usize) {
        self.state().failing_waits = count;
        self.inner.edges.notify_all();
    }

    /// Make the line vanish, every following wait fails fatally.
    pub fn unplug(&self) {
        self.state().unplugged = true;
        self.inner.edges.notify_all();
    }

    pub fn settings(&self) -> Option<LineSettings> {
        self.state().settings
    }

    pub fn is_claimed(&self) -> bool {
        self.state().claimed
    }

    pub fn release_count(&self) -> usize {
        self.state().releases
    }

    /// If an edge handler is installed on an evented line.
    pub fn has_handler(&self) -> bool {
        lock(&self.inner.handler).is_some()
    }
}

struct SimLine {
    pin: SimPin,
    released: bool,
}

impl Line for SimLine {
    fn configure(&mut self, settings: &LineSettings) -> Result<(), LineError> {
        if self.released {
            return Err(LineError::Released);
        }
        let capabilities = self.pin.inner.capabilities;
        if !capabilities.input {
            return Err(LineError::Unsupported(Feature::Input));
        }
        if settings.bias != Bias::AsIs && !capabilities.bias {
            return Err(LineError::Unsupported(Feature::Bias));
        }
        if settings.debounce.is_some() && !capabilities.debounce {
            return Err(LineError::Unsupported(Feature::Debounce));
        }

        let mut state = self.pin.state();
        state.settings = Some(*settings);
        match settings.bias {
            Bias::PullUp => state.level = Level::High,
            Bias::PullDown => state.level = Level::Low,
            Bias::AsIs | Bias::Disabled => {}
        }
        Ok(())
    }

    fn read_level(&mut self) -> Result<Level, LineError> {
        if self.released {
            return Err(LineError::Released);
        }
        let mut state = self.pin.state();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(LineError::Read("simulated read failure".into()));
        }
        Ok(state.level)
    }

    fn release(&mut self) -> Result<(), LineError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        {
            let mut state = self.pin.state();
            state.claimed = false;
            state.settings = None;
            state.pending.clear();
            state.last_delivered = None;
            state.releases += 1;
        }
        self.pin.inner.edges.notify_all();
        // waits for a handler that is running right now
        lock(&self.pin.inner.handler).take();
        Ok(())
    }
}

impl PollLine for SimLine {
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<WaitOutcome, LineError> {
        if self.released {
            return Err(LineError::Released);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.pin.state();
        loop {
            if state.unplugged {
                return Err(LineError::NotFound(self.pin.inner.name.clone()));
            }
            if state.failing_waits > 0 {
                state.failing_waits -= 1;
                return Err(LineError::Other("simulated wait failure".into()));
            }
            if let Some(event) = state.pending.pop_front() {
                state.level = event.level;
                return Ok(WaitOutcome::Edge(event.timestamp));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::Timeout);
            }
            state = self
                .pin
                .inner
                .edges
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl EventLine for SimLine {
    fn subscribe(&mut self, handler: EdgeHandler) -> Result<(), LineError> {
        if self.released {
            return Err(LineError::Released);
        }
        *lock(&self.pin.inner.handler) = Some(handler);
        Ok(())
    }
}

impl Drop for SimLine {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
