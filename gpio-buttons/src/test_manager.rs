use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::line::{Bias, EdgeMode, Feature, Level, LineError};
use crate::sim::{Capabilities, Delivery, SimChip, SimPin};
use crate::*;

const POLL: Duration = Duration::from_millis(5);

fn ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn manager(chip: &SimChip) -> ButtonManager {
    ButtonManager::new(chip.clone()).poll_timeout(POLL)
}

/// Records the identifier of every callback invocation.
#[derive(Clone, Default)]
struct Presses(Arc<Mutex<Vec<String>>>);

impl Presses {
    fn callback(&self) -> impl Fn(&str) + Send + Sync + 'static {
        let presses = self.0.clone();
        move |id: &str| presses.lock().unwrap().push(id.to_owned())
    }

    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn of(&self, id: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|p| *p == id).count()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(ms(5)).await;
    }
    condition()
}

/// Gives anything that should not happen a chance to happen.
async fn settle() {
    tokio::time::sleep(ms(60)).await;
}

fn press(pin: &SimPin, at: u64) {
    pin.edge(Level::Low, ms(at));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edges_only_trigger_their_own_button() {
    let chip = SimChip::new();
    let first = chip.add_line("17", Capabilities::default());
    let second = chip.add_line("27", Capabilities::default());
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()))
        .unwrap();
    manager
        .register_button(ButtonConfig::new("27", presses.callback()))
        .unwrap();
    assert_eq!(manager.button_count(), 2);

    manager.start().unwrap();
    assert!(manager.is_running());
    assert_eq!(manager.button_state("17"), Some(ButtonState::Running));

    press(&first, 0);
    assert!(eventually(|| presses.of("17") == 1).await);
    settle().await;
    assert_eq!(presses.of("27"), 0);

    press(&second, 10);
    assert!(eventually(|| presses.of("27") == 1).await);
    assert_eq!(presses.count(), 2);

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_before_start_does_nothing() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let presses = Presses::default();
    let mut manager = manager(&chip);

    ButtonManager::new(SimChip::new()).stop().await;

    manager
        .register_button(ButtonConfig::new("17", presses.callback()))
        .unwrap();
    manager.stop().await;
    manager.stop().await;
    assert_eq!(presses.count(), 0);
    assert_eq!(manager.button_state("17"), Some(ButtonState::Configured));
    assert_eq!(pin.release_count(), 0);

    manager.start().unwrap();
    press(&pin, 0);
    assert!(eventually(|| presses.count() == 1).await);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_a_running_callback() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let mut manager = manager(&chip);
    let (on_start, on_finish) = (started.clone(), finished.clone());
    manager
        .register_button(ButtonConfig::new("17", move |_| {
            on_start.store(true, Ordering::SeqCst);
            std::thread::sleep(ms(150));
            on_finish.store(true, Ordering::SeqCst);
        }))
        .unwrap();

    manager.start().unwrap();
    press(&pin, 0);
    assert!(eventually(|| started.load(Ordering::SeqCst)).await);
    assert!(!finished.load(Ordering::SeqCst));

    manager.stop().await;
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(pin.release_count(), 1);
    assert_eq!(manager.button_state("17"), Some(ButtonState::Released));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_releases_every_line_and_silences_callbacks() {
    let chip = SimChip::new();
    let pins = [
        chip.add_line("17", Capabilities::default()),
        chip.add_line(
            "27",
            Capabilities {
                delivery: Delivery::Event,
                ..Capabilities::default()
            },
        ),
    ];
    let presses = Presses::default();
    let mut manager = manager(&chip);
    for pin in &pins {
        manager
            .register_button(ButtonConfig::new(pin.name(), presses.callback()))
            .unwrap();
    }

    manager.start().unwrap();
    assert!(pins[1].has_handler());
    manager.stop().await;

    for pin in &pins {
        assert_eq!(pin.release_count(), 1);
        assert!(!pin.is_claimed());
        assert!(!pin.has_handler());
        assert_eq!(manager.button_state(pin.name()), Some(ButtonState::Released));
        press(pin, 0);
    }
    settle().await;
    assert_eq!(presses.count(), 0);
    assert!(!manager.is_running());

    manager.stop().await;
    drop(manager);
    for pin in &pins {
        assert_eq!(pin.release_count(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bare_input_line_registers_through_fallback() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::bare_input());
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()).pull(Pull::Up))
        .unwrap();

    let settings = pin.settings().expect("line is configured");
    assert_eq!(settings.bias, Bias::AsIs);
    assert_eq!(settings.debounce, None);
    assert_eq!(settings.edge, EdgeMode::Both);

    manager.start().unwrap();
    press(&pin, 0);
    press(&pin, 20);
    press(&pin, 100);
    assert!(eventually(|| presses.count() == 2).await);
    settle().await;
    assert_eq!(presses.count(), 2);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn presses_inside_the_window_are_debounced() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(
            ButtonConfig::new("17", presses.callback())
                .debounce(ms(50))
                .active_low(true),
        )
        .unwrap();

    // no hardware debounce on this line, the pull-up is kept
    let settings = pin.settings().expect("line is configured");
    assert_eq!(settings.bias, Bias::PullUp);
    assert_eq!(settings.debounce, None);

    manager.start().unwrap();
    press(&pin, 0);
    press(&pin, 30);
    press(&pin, 80);
    assert!(eventually(|| presses.count() == 2).await);
    settle().await;
    assert_eq!(presses.count(), 2);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn granted_hardware_debounce_is_the_only_debounce() {
    let chip = SimChip::new();
    let pin = chip.add_line(
        "17",
        Capabilities {
            debounce: true,
            ..Capabilities::default()
        },
    );
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()).debounce(ms(50)))
        .unwrap();
    assert_eq!(pin.settings().and_then(|s| s.debounce), Some(ms(50)));

    manager.start().unwrap();
    press(&pin, 0);
    press(&pin, 30);
    press(&pin, 80);
    // exactly one window after the last press passes the hardware filter,
    // the software gate would reject it
    press(&pin, 130);
    assert!(eventually(|| presses.count() == 3).await);
    settle().await;
    assert_eq!(presses.count(), 3);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_edges_are_not_presses() {
    let chip = SimChip::new();
    let low = chip.add_line("17", Capabilities::default());
    let high = chip.add_line("27", Capabilities::default());
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()))
        .unwrap();
    manager
        .register_button(
            ButtonConfig::new("27", presses.callback())
                .pull(Pull::Down)
                .active_low(false),
        )
        .unwrap();

    manager.start().unwrap();
    low.edge(Level::Low, ms(0));
    low.edge(Level::High, ms(100));
    high.edge(Level::High, ms(0));
    high.edge(Level::Low, ms(100));
    assert!(eventually(|| presses.count() == 2).await);
    settle().await;
    assert_eq!(presses.of("17"), 1);
    assert_eq!(presses.of("27"), 1);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evented_lines_watch_the_press_edge() {
    let chip = SimChip::new();
    let pin = chip.add_line(
        "17",
        Capabilities {
            delivery: Delivery::Event,
            ..Capabilities::default()
        },
    );
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()).debounce(ms(50)))
        .unwrap();
    assert_eq!(pin.settings().map(|s| s.edge), Some(EdgeMode::Falling));

    manager.start().unwrap();
    // no edge after start may be missed
    assert!(pin.has_handler());
    press(&pin, 0);
    pin.edge(Level::High, ms(10));
    press(&pin, 30);
    press(&pin, 80);
    assert!(eventually(|| presses.count() == 2).await);
    settle().await;
    assert_eq!(presses.count(), 2);
    manager.stop().await;
    assert_eq!(pin.release_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_callback_keeps_the_button_alive() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("callback failure");
            }
        }))
        .unwrap();

    manager.start().unwrap();
    press(&pin, 0);
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);
    press(&pin, 100);
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 2).await);
    manager.stop().await;
    assert_eq!(pin.release_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_errors_are_retried() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()))
        .unwrap();

    pin.fail_reads(1);
    manager.start().unwrap();
    // the first edge is lost to the failed read
    press(&pin, 0);
    press(&pin, 100);
    assert!(eventually(|| presses.count() == 1).await);

    pin.fail_waits(3);
    press(&pin, 200);
    assert!(eventually(|| presses.count() == 2).await);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_line_error_only_stops_that_button() {
    let chip = SimChip::new();
    let broken = chip.add_line("17", Capabilities::default());
    let healthy = chip.add_line("27", Capabilities::default());
    let presses = Presses::default();
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", presses.callback()))
        .unwrap();
    manager
        .register_button(ButtonConfig::new("27", presses.callback()))
        .unwrap();

    manager.start().unwrap();
    broken.unplug();
    assert!(eventually(|| broken.release_count() == 1).await);
    assert!(eventually(|| manager.button_state("17") == Some(ButtonState::Released)).await);
    assert_eq!(manager.button_state("27"), Some(ButtonState::Running));

    press(&healthy, 0);
    assert!(eventually(|| presses.of("27") == 1).await);
    manager.stop().await;
    assert_eq!(broken.release_count(), 1);
    assert_eq!(healthy.release_count(), 1);
}

#[tokio::test]
async fn unknown_pin_is_not_registered() {
    let chip = SimChip::new();
    chip.add_line("17", Capabilities::default());
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", |_| {}))
        .unwrap();

    let result = manager.register_button(ButtonConfig::new("99", |_| {}));
    assert!(matches!(result, Err(Error::PinNotFound(pin)) if pin == "99"));
    assert_eq!(manager.button_count(), 1);

    assert!(matches!(
        manager.register_button(ButtonConfig::new("  ", |_| {})),
        Err(Error::InvalidIdentifier)
    ));
    assert_eq!(manager.button_count(), 1);
}

#[tokio::test]
async fn failed_configuration_releases_the_line() {
    let chip = SimChip::new();
    let output_only = chip.add_line(
        "17",
        Capabilities {
            input: false,
            ..Capabilities::default()
        },
    );
    chip.add_line(
        "27",
        Capabilities {
            busy: true,
            ..Capabilities::default()
        },
    );
    let mut manager = manager(&chip);

    let result = manager.register_button(ButtonConfig::new("17", |_| {}));
    assert!(matches!(
        result,
        Err(Error::PinConfigurationFailed {
            source: LineError::Unsupported(Feature::Input),
            ..
        })
    ));
    assert_eq!(output_only.release_count(), 1);
    assert!(!output_only.is_claimed());

    let result = manager.register_button(ButtonConfig::new("27", |_| {}));
    assert!(matches!(
        result,
        Err(Error::PinConfigurationFailed {
            source: LineError::Busy,
            ..
        })
    ));
    assert_eq!(manager.button_count(), 0);
}

#[tokio::test]
async fn identifiers_are_unique_until_removed() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", |_| {}))
        .unwrap();
    assert!(matches!(
        manager.register_button(ButtonConfig::new(" 17 ", |_| {})),
        Err(Error::DuplicateButton(_))
    ));

    manager.remove_button("17").unwrap();
    assert_eq!(pin.release_count(), 1);
    assert_eq!(manager.button_state("17"), None);
    assert!(matches!(
        manager.remove_button("17"),
        Err(Error::UnknownButton(_))
    ));

    manager
        .register_button(ButtonConfig::new("17", |_| {}))
        .unwrap();
    assert_eq!(manager.identifiers().collect::<Vec<_>>(), vec!["17"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_errors() {
    let chip = SimChip::new();
    chip.add_line("17", Capabilities::default());
    chip.add_line("27", Capabilities::default());
    let mut manager = manager(&chip);
    assert!(matches!(manager.start(), Err(Error::NoButtonsConfigured)));

    manager
        .register_button(ButtonConfig::new("17", |_| {}))
        .unwrap();
    manager.start().unwrap();
    assert!(matches!(manager.start(), Err(Error::AlreadyStarted)));
    assert!(matches!(
        manager.register_button(ButtonConfig::new("27", |_| {})),
        Err(Error::RegistrationClosed)
    ));
    assert!(matches!(
        manager.remove_button("17"),
        Err(Error::RegistrationClosed)
    ));
    assert_eq!(manager.button_count(), 1);

    manager.stop().await;
    assert!(matches!(manager.start(), Err(Error::AlreadyStarted)));
}

#[test]
fn dropping_an_unstarted_manager_releases_lines() {
    let chip = SimChip::new();
    let pin = chip.add_line("17", Capabilities::default());
    let mut manager = manager(&chip);
    manager
        .register_button(ButtonConfig::new("17", |_| {}))
        .unwrap();
    assert!(pin.is_claimed());

    drop(manager);
    assert_eq!(pin.release_count(), 1);
    assert!(!pin.is_claimed());
}
