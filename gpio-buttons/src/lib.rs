//! Debounced, callback driven monitoring of GPIO buttons.
//!
//! Register buttons on a [ButtonManager], [start](ButtonManager::start) it
//! from within a tokio runtime, and every accepted press calls the button's
//! callback with its identifier. Hardware access goes through a
//! [LineProvider](line::LineProvider): [sim] for tests, `rpi` (feature `rpi`)
//! for a Raspberry Pi.

pub mod config;
pub mod debounce;
pub mod line;
#[cfg(feature = "rpi")]
pub mod rpi;
pub mod sim;
mod watch;

#[cfg(test)]
mod test_manager;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use config::{ButtonCallback, ButtonConfig, ButtonSettings, Pull};
use debounce::DebounceGate;
use line::{Bias, Feature, LineError, LineHandle, LineProvider, LineSettings};
use watch::PressSink;

/// Upper bound for how long a polled line blocks before the watch loop looks
/// at the cancellation token again.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Configuring,
    Running,
    Stopped,
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Lifecycle of a registered button.
///
/// ```mermaid
/// stateDiagram-v2
///    [*] --> Configured: register_button
///    Configured --> [*]: remove_button
///    Configured --> Running: start
///    Running --> Stopping: stop
///    Running --> Released: line failed
///    Stopping --> Released: watch activity exited
///    Released --> [*]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonState {
    /// The line is open and configured, nothing watches it yet.
    Configured,
    Running,
    /// Cancellation was requested, the watch activity has not exited yet.
    Stopping,
    /// The line was given back, after [stop](ButtonManager::stop) or because
    /// the line failed while running. Final.
    Released,
}

/// How much of the requested line configuration the hardware accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    Full,
    WithoutBias,
    WithoutDebounce,
    Bare,
}

/// Requests to try in order, from the full request down to a bare input.
/// Requests identical to an earlier one are left out.
fn fallback_chain(requested: LineSettings) -> Vec<(Attempt, LineSettings)> {
    let has_bias = requested.bias != Bias::AsIs;
    let has_debounce = requested.debounce.is_some();

    let mut chain = vec![(Attempt::Full, requested)];
    if has_bias {
        chain.push((
            Attempt::WithoutBias,
            LineSettings {
                bias: Bias::AsIs,
                ..requested
            },
        ));
    }
    if has_debounce {
        chain.push((
            Attempt::WithoutDebounce,
            LineSettings {
                debounce: None,
                ..requested
            },
        ));
    }
    if has_bias && has_debounce {
        chain.push((
            Attempt::Bare,
            LineSettings {
                bias: Bias::AsIs,
                debounce: None,
                ..requested
            },
        ));
    }
    chain
}

#[derive(Debug)]
struct Button {
    config: ButtonConfig,
    /// Taken by the watch activity on start.
    line: Option<LineHandle>,
    gate: Arc<DebounceGate>,
    state: ButtonState,
    /// Set by the watch activity once it gave the line back.
    released: Arc<AtomicBool>,
}

impl Button {
    fn state(&self) -> ButtonState {
        match self.state {
            ButtonState::Running | ButtonState::Stopping
                if self.released.load(Ordering::Acquire) =>
            {
                ButtonState::Released
            }
            state => state,
        }
    }
}

pub struct ButtonManager {
    provider: Box<dyn LineProvider>,
    buttons: HashMap<String, Button>,
    phase: Phase,
    poll_timeout: Duration,
    cancellation_token: CancellationToken,
    watchers: JoinSet<Arc<str>>,
    dispatchers: JoinSet<()>,
}

impl ButtonManager {
    pub fn new(provider: impl LineProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            buttons: HashMap::new(),
            phase: Phase::Configuring,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            cancellation_token: CancellationToken::new(),
            watchers: JoinSet::new(),
            dispatchers: JoinSet::new(),
        }
    }

    /// Bounds how long [stop](Self::stop) may wait for a polled line.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Open and configure the button's line. Only possible before
    /// [start](Self::start).
    ///
    /// Hardware debounce is requested first. If the line grants it, the
    /// software debounce of this button is disabled, otherwise the software
    /// gate enforces the window. A line that rejects the requested bias or
    /// debounce is retried with weaker settings down to a bare input.
    #[tracing::instrument(skip_all, fields(button = %config.identifier()))]
    pub fn register_button(&mut self, config: ButtonConfig) -> Result<(), Error> {
        if self.phase != Phase::Configuring {
            return Err(Error::RegistrationClosed);
        }
        let config = config.normalized().ok_or(Error::InvalidIdentifier)?;
        let id = config.identifier().to_owned();
        if self.buttons.contains_key(&id) {
            return Err(Error::DuplicateButton(id));
        }

        let mut line = self.provider.open(&id).map_err(|error| match error {
            LineError::NotFound(_) => Error::PinNotFound(id.clone()),
            source => Error::PinConfigurationFailed {
                pin: id.clone(),
                source,
            },
        })?;

        let window = config.debounce_window();
        let requested = LineSettings {
            bias: config.pull_mode().into(),
            edge: line.press_edges(config.is_active_low()),
            debounce: Some(window).filter(|window| !window.is_zero()),
        };

        let mut granted = None;
        let mut last_error = None;
        for (attempt, settings) in fallback_chain(requested) {
            match line.configure(&settings) {
                Ok(()) => {
                    granted = Some((attempt, settings));
                    break;
                }
                Err(error) => {
                    tracing::debug!(?attempt, ?error, "line rejected configuration");
                    last_error = Some(error);
                }
            }
        }
        let Some((attempt, settings)) = granted else {
            if let Err(error) = line.release() {
                tracing::warn!(?error, "failed to release line after configuration failed");
            }
            return Err(Error::PinConfigurationFailed {
                pin: id,
                source: last_error.unwrap_or(LineError::Unsupported(Feature::Input)),
            });
        };
        if attempt != Attempt::Full {
            tracing::warn!(?attempt, ?settings, "line configured with reduced settings");
        }

        let hardware_debounce = settings.debounce.is_some();
        let gate_window = if hardware_debounce {
            Duration::ZERO
        } else {
            window
        };
        tracing::info!(
            active_low = config.is_active_low(),
            debounce = ?window,
            hardware_debounce,
            pull = ?config.pull_mode(),
            "added button"
        );
        self.buttons.insert(
            id,
            Button {
                config,
                line: Some(line),
                gate: Arc::new(DebounceGate::new(gate_window)),
                state: ButtonState::Configured,
                released: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    /// Release a registered button's line and forget it, so its identifier can
    /// be registered again. Only possible before [start](Self::start).
    pub fn remove_button(&mut self, identifier: &str) -> Result<(), Error> {
        if self.phase != Phase::Configuring {
            return Err(Error::RegistrationClosed);
        }
        let identifier = identifier.trim();
        let mut button = self
            .buttons
            .remove(identifier)
            .ok_or_else(|| Error::UnknownButton(identifier.to_owned()))?;
        if let Some(mut line) = button.line.take() {
            if let Err(error) = line.release() {
                tracing::warn!(button = %identifier, ?error, "failed to release line");
            }
        }
        tracing::info!(button = %identifier, "removed button");
        Ok(())
    }

    /// Start one watch activity and one callback dispatcher per button on the
    /// current tokio runtime.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.phase != Phase::Configuring {
            return Err(Error::AlreadyStarted);
        }
        if self.buttons.is_empty() {
            return Err(Error::NoButtonsConfigured);
        }
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        for (id, button) in self.buttons.iter_mut() {
            let Some(line) = button.line.take() else {
                continue;
            };
            let id: Arc<str> = Arc::from(id.as_str());
            let (presses_tx, presses_rx) = mpsc::unbounded_channel();
            let sink = PressSink {
                id: id.clone(),
                gate: button.gate.clone(),
                active_low: button.config.is_active_low(),
                presses: presses_tx,
            };
            self.dispatchers.spawn_on(
                watch::dispatch(
                    id.clone(),
                    button.config.callback(),
                    presses_rx,
                    self.cancellation_token.clone(),
                ),
                &runtime,
            );

            let token = self.cancellation_token.clone();
            let released = button.released.clone();
            match line {
                LineHandle::Polled(line) => {
                    let timeout = self.poll_timeout;
                    self.watchers.spawn_blocking_on(
                        move || watch::poll_edges(line, sink, token, timeout, released),
                        &runtime,
                    );
                }
                LineHandle::Evented(mut line) => match watch::subscribe(&mut *line, sink) {
                    Ok(()) => {
                        tracing::debug!(button = %id, "edge handler installed");
                        self.watchers
                            .spawn_on(watch::hold_line(line, id, token, released), &runtime);
                    }
                    Err(error) => {
                        tracing::error!(button = %id, ?error, "failed to install edge handler, not watching this button");
                        watch::release_line(&mut *line, &id, &released);
                    }
                },
            }
            button.state = ButtonState::Running;
        }

        self.phase = Phase::Running;
        tracing::info!(buttons = self.buttons.len(), "monitoring buttons");
        Ok(())
    }

    /// Cancel all watch activities and wait until every one of them released
    /// its line and no callback is running anymore. Does nothing before
    /// [start](Self::start) or when already stopped.
    ///
    /// A callback that is running when `stop` is called finishes first.
    /// Presses that were accepted but whose callback has not started yet are
    /// dropped.
    pub async fn stop(&mut self) {
        match self.phase {
            Phase::Configuring => {
                tracing::debug!("stop requested before start, nothing is running");
                return;
            }
            Phase::Stopped => return,
            Phase::Running => {}
        }

        self.cancellation_token.cancel();
        for button in self.buttons.values_mut() {
            button.state = ButtonState::Stopping;
        }

        while let Some(exited) = self.watchers.join_next().await {
            match exited {
                Ok(id) => tracing::debug!(button = %id, "watch activity exited"),
                // the line was dropped while unwinding
                Err(error) => tracing::error!(?error, "watch activity failed"),
            }
        }
        while let Some(exited) = self.dispatchers.join_next().await {
            if let Err(error) = exited {
                tracing::error!(?error, "callback dispatcher failed");
            }
        }

        for button in self.buttons.values_mut() {
            button.state = ButtonState::Released;
        }
        self.phase = Phase::Stopped;
        tracing::info!("stopped all button monitoring");
    }

    pub fn button_count(&self) -> usize {
        self.buttons.len()
    }

    /// A running button whose line failed reports [ButtonState::Released]
    /// right away, the others stay [ButtonState::Running] until stopped.
    pub fn button_state(&self, identifier: &str) -> Option<ButtonState> {
        self.buttons.get(identifier.trim()).map(Button::state)
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.buttons.keys().map(String::as_str)
    }
}

impl Drop for ButtonManager {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        for (id, button) in self.buttons.iter_mut() {
            if let Some(mut line) = button.line.take() {
                if let Err(error) = line.release() {
                    tracing::warn!(button = %id, ?error, "failed to release line");
                }
            }
        }
    }
}

impl fmt::Debug for ButtonManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ButtonManager")
            .field("buttons", &self.buttons)
            .field("phase", &self.phase)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("pin {0:?} does not resolve to a GPIO line")]
    PinNotFound(String),
    #[error("button identifier is empty")]
    InvalidIdentifier,
    #[error("failed to configure pin {pin:?}")]
    PinConfigurationFailed {
        pin: String,
        #[source]
        source: LineError,
    },
    #[error("button {0:?} is already registered")]
    DuplicateButton(String),
    #[error("no button {0:?} is registered")]
    UnknownButton(String),
    #[error("buttons can only be changed before the manager is started")]
    RegistrationClosed,
    #[error("no buttons configured")]
    NoButtonsConfigured,
    #[error("the manager was already started")]
    AlreadyStarted,
    #[error("the manager must be started from within a tokio runtime")]
    NoRuntime,
}
