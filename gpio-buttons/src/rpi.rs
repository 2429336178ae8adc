//! Raspberry Pi GPIO through `rppal`.
//!
//! Identifiers are BCM numbers, written as `17`, `GPIO17`, `BCM17` or
//! `gpiochip0:17`. rppal has no hardware debounce, requests for it are
//! rejected so the software gate takes over.

use std::time::{Duration, Instant};

use rppal::gpio::{Error as GpioError, Gpio, InputPin, Level as PinLevel, Pin, Trigger};

use crate::line::{
    Bias, EdgeEvent, EdgeHandler, EdgeMode, EventLine, Feature, Level, Line, LineError,
    LineHandle, LineProvider, LineSettings, PollLine, WaitOutcome,
};

impl From<PinLevel> for Level {
    fn from(level: PinLevel) -> Self {
        match level {
            PinLevel::Low => Level::Low,
            PinLevel::High => Level::High,
        }
    }
}

impl From<EdgeMode> for Trigger {
    fn from(edge: EdgeMode) -> Self {
        match edge {
            EdgeMode::Rising => Trigger::RisingEdge,
            EdgeMode::Falling => Trigger::FallingEdge,
            EdgeMode::Both => Trigger::Both,
        }
    }
}

impl From<GpioError> for LineError {
    fn from(error: GpioError) -> Self {
        match error {
            GpioError::PinNotAvailable(pin) => LineError::NotFound(pin.to_string()),
            GpioError::PinUsed(_) => LineError::Busy,
            GpioError::PermissionDenied(path) => LineError::PermissionDenied(path),
            GpioError::Io(error) => LineError::Io(error),
            other => LineError::Other(other.to_string()),
        }
    }
}

/// Parses `17`, `GPIO17`, `BCM17` and `gpiochip0:17` into a BCM number.
pub fn parse_bcm(identifier: &str) -> Option<u8> {
    let identifier = identifier.trim();
    let number = match identifier.split_once(':') {
        Some((chip, line)) if chip.eq_ignore_ascii_case("gpiochip0") => line,
        Some(_) => return None,
        None => {
            let upper = identifier.to_ascii_uppercase();
            let prefix = ["GPIO", "BCM"]
                .into_iter()
                .find(|prefix| upper.starts_with(prefix))
                .map_or(0, str::len);
            &identifier[prefix..]
        }
    };
    number.trim().parse().ok()
}

/// How lines opened by [RpiGpio] deliver edges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Blocking `poll_interrupt` on the watch thread.
    #[default]
    Poll,
    /// rppal's interrupt thread calls the edge handler.
    Event,
}

pub struct RpiGpio {
    gpio: Gpio,
    delivery: Delivery,
}

impl RpiGpio {
    pub fn new() -> Result<Self, LineError> {
        Ok(Self {
            gpio: Gpio::new()?,
            delivery: Delivery::default(),
        })
    }

    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }
}

impl LineProvider for RpiGpio {
    fn open(&self, identifier: &str) -> Result<LineHandle, LineError> {
        let bcm = parse_bcm(identifier).ok_or_else(|| LineError::NotFound(identifier.to_owned()))?;
        let pin = self.gpio.get(bcm)?;
        let line = RpiLine {
            gpio: self.gpio.clone(),
            bcm,
            pin: PinState::Unconfigured(pin),
            trigger: Trigger::Both,
            origin: Instant::now(),
        };
        Ok(match self.delivery {
            Delivery::Poll => LineHandle::Polled(Box::new(line)),
            Delivery::Event => LineHandle::Evented(Box::new(line)),
        })
    }
}

enum PinState {
    Unconfigured(Pin),
    Input(InputPin),
    Released,
}

struct RpiLine {
    /// Reopens the pin when a configuration attempt has to start over.
    gpio: Gpio,
    bcm: u8,
    pin: PinState,
    trigger: Trigger,
    /// Edge timestamps are measured from here.
    origin: Instant,
}

impl RpiLine {
    fn input(&mut self) -> Result<&mut InputPin, LineError> {
        match &mut self.pin {
            PinState::Input(pin) => Ok(pin),
            PinState::Unconfigured(_) => Err(LineError::Other(format!(
                "GPIO{} is not configured as input",
                self.bcm
            ))),
            PinState::Released => Err(LineError::Released),
        }
    }

    /// Takes the pin for a new configuration. A configured pin is closed and
    /// opened again, so every attempt starts from the same state.
    fn take_pin(&mut self) -> Result<Pin, LineError> {
        match std::mem::replace(&mut self.pin, PinState::Released) {
            PinState::Unconfigured(pin) => Ok(pin),
            PinState::Input(input) => {
                close(input)?;
                Ok(self.gpio.get(self.bcm)?)
            }
            PinState::Released => Err(LineError::Released),
        }
    }
}

fn close(mut input: InputPin) -> Result<(), LineError> {
    let cleared = input.clear_async_interrupt().and(input.clear_interrupt());
    drop(input);
    cleared.map_err(LineError::from)
}

impl Line for RpiLine {
    fn configure(&mut self, settings: &LineSettings) -> Result<(), LineError> {
        if settings.debounce.is_some() {
            return Err(LineError::Unsupported(Feature::Debounce));
        }
        let pin = self.take_pin()?;

        // rppal resets the bias when converting, there is no "as is"
        let mut input = match settings.bias {
            Bias::PullUp => pin.into_input_pullup(),
            Bias::PullDown => pin.into_input_pulldown(),
            Bias::AsIs | Bias::Disabled => pin.into_input(),
        };
        let trigger: Trigger = settings.edge.into();
        if let Err(error) = input.set_interrupt(trigger) {
            if let Err(close_error) = close(input) {
                tracing::debug!(pin = self.bcm, ?close_error, "failed to clear interrupts");
            }
            // the line stays open for a weaker request
            match self.gpio.get(self.bcm) {
                Ok(pin) => self.pin = PinState::Unconfigured(pin),
                Err(reopen_error) => {
                    tracing::warn!(pin = self.bcm, ?reopen_error, "failed to reopen pin");
                }
            }
            return Err(error.into());
        }
        self.trigger = trigger;
        self.pin = PinState::Input(input);
        Ok(())
    }

    fn read_level(&mut self) -> Result<Level, LineError> {
        Ok(self.input()?.read().into())
    }

    fn release(&mut self) -> Result<(), LineError> {
        if let PinState::Input(input) = std::mem::replace(&mut self.pin, PinState::Released) {
            close(input)?;
        }
        Ok(())
    }
}

impl PollLine for RpiLine {
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<WaitOutcome, LineError> {
        let origin = self.origin;
        match self.input()?.poll_interrupt(false, Some(timeout))? {
            Some(_) => Ok(WaitOutcome::Edge(origin.elapsed())),
            None => Ok(WaitOutcome::Timeout),
        }
    }
}

impl EventLine for RpiLine {
    fn subscribe(&mut self, mut handler: EdgeHandler) -> Result<(), LineError> {
        let origin = self.origin;
        let trigger = self.trigger;
        let pin = self.input()?;
        // the async interrupt replaces the synchronous one set in configure
        pin.clear_interrupt()?;
        pin.set_async_interrupt(trigger, move |level: PinLevel| {
            handler(EdgeEvent {
                timestamp: origin.elapsed(),
                level: level.into(),
            })
        })?;
        Ok(())
    }
}
