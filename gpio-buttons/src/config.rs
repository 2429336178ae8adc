use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::line::Bias;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Called with the button's identifier for every accepted press.
pub type ButtonCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Internal resistor requested for a button's line.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Pull {
    /// Keep the platform's current bias.
    NoChange,
    /// Pull the line high, for buttons that connect it to ground.
    #[default]
    Up,
    Down,
    Disabled,
}

impl From<Pull> for Bias {
    fn from(pull: Pull) -> Self {
        match pull {
            Pull::NoChange => Bias::AsIs,
            Pull::Up => Bias::PullUp,
            Pull::Down => Bias::PullDown,
            Pull::Disabled => Bias::Disabled,
        }
    }
}

/// The serializable part of a button's configuration, e.g. one entry of a
/// JSON config file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ButtonSettings {
    /// Identifier of the line, understood by the [LineProvider](crate::line::LineProvider).
    pub pin: String,
    /// Minimum time between two presses in milliseconds. `None` means the
    /// 50 ms default, `Some(0)` disables debouncing.
    pub debounce_ms: Option<u64>,
    pub pull: Pull,
    /// If a low level means the button is pressed.
    pub active_low: bool,
}

impl Default for ButtonSettings {
    fn default() -> Self {
        Self {
            pin: String::new(),
            debounce_ms: None,
            pull: Pull::default(),
            active_low: true,
        }
    }
}

/// Everything needed to register one button.
///
/// Defaults describe a button wired between the pin and ground: internal
/// pull-up, active low, 50 ms debounce.
#[derive(Clone)]
pub struct ButtonConfig {
    identifier: String,
    callback: ButtonCallback,
    debounce: Duration,
    pull: Pull,
    active_low: bool,
}

impl ButtonConfig {
    pub fn new<F>(identifier: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            identifier: identifier.into(),
            callback: Arc::new(callback),
            debounce: DEFAULT_DEBOUNCE,
            pull: Pull::default(),
            active_low: true,
        }
    }

    pub fn from_settings<F>(settings: ButtonSettings, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let config = Self::new(settings.pin, callback)
            .pull(settings.pull)
            .active_low(settings.active_low);
        match settings.debounce_ms {
            Some(ms) => config.debounce(Duration::from_millis(ms)),
            None => config,
        }
    }

    /// Zero disables debouncing.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn pull(mut self, pull: Pull) -> Self {
        self.pull = pull;
        self
    }

    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn debounce_window(&self) -> Duration {
        self.debounce
    }

    pub fn pull_mode(&self) -> Pull {
        self.pull
    }

    pub fn is_active_low(&self) -> bool {
        self.active_low
    }

    pub(crate) fn callback(&self) -> ButtonCallback {
        self.callback.clone()
    }

    /// Trims the identifier. Returns `None` if nothing is left.
    pub(crate) fn normalized(mut self) -> Option<Self> {
        let trimmed = self.identifier.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() != self.identifier.len() {
            self.identifier = trimmed.to_owned();
        }
        Some(self)
    }
}

impl fmt::Debug for ButtonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ButtonConfig")
            .field("identifier", &self.identifier)
            .field("debounce", &self.debounce)
            .field("pull", &self.pull)
            .field("active_low", &self.active_low)
            .finish_non_exhaustive()
    }
}
