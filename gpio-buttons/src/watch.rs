//! Per-button watch activities and callback dispatch.
//!
//! Polled lines get a loop on the blocking pool. Evented lines get their
//! handler installed on start and a task that holds the line until
//! cancellation. Both feed accepted presses into an unbounded channel,
//! drained by one dispatcher per button.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ButtonCallback;
use crate::debounce::{DebounceGate, Verdict};
use crate::line::{
    is_pressed, EdgeEvent, EventLine, Level, Line, LineError, PollLine, WaitOutcome,
};

/// Filters edges of one button and forwards the accepted presses.
#[derive(Clone)]
pub(crate) struct PressSink {
    pub id: Arc<str>,
    pub gate: Arc<DebounceGate>,
    pub active_low: bool,
    pub presses: mpsc::UnboundedSender<Duration>,
}

impl PressSink {
    /// Returns false once the dispatcher is gone.
    fn offer(&self, level: Level, timestamp: Duration) -> bool {
        if !is_pressed(level, self.active_low) {
            return true;
        }
        match self.gate.consider(timestamp) {
            Verdict::Accept => {
                tracing::trace!(button = %self.id, ?timestamp, "press accepted");
                self.presses.send(timestamp).is_ok()
            }
            Verdict::Reject => {
                tracing::trace!(button = %self.id, ?timestamp, "press debounced");
                true
            }
        }
    }
}

/// Blocking watch loop for a polled line. Releases the line before returning
/// the button's identifier.
pub(crate) fn poll_edges(
    mut line: Box<dyn PollLine>,
    sink: PressSink,
    token: CancellationToken,
    timeout: Duration,
    released: Arc<AtomicBool>,
) -> Arc<str> {
    tracing::debug!(button = %sink.id, "watching for edges");
    while !token.is_cancelled() {
        match line.wait_for_edge(timeout) {
            Ok(WaitOutcome::Timeout) => continue,
            Ok(WaitOutcome::Edge(timestamp)) => match line.read_level() {
                Ok(level) => {
                    if !sink.offer(level, timestamp) {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(button = %sink.id, ?error, "failed to read level after edge");
                }
            },
            Err(error) if error.is_fatal() => {
                tracing::error!(button = %sink.id, ?error, "line failed, no longer watching this button");
                break;
            }
            Err(error) => {
                tracing::warn!(button = %sink.id, ?error, "waiting for an edge failed, retrying");
                std::thread::sleep(timeout);
            }
        }
    }
    release_line(&mut *line, &sink.id, &released);
    tracing::debug!(button = %sink.id, "stopped watching");
    sink.id
}

/// Gives the line back and marks it released, even if releasing failed.
pub(crate) fn release_line<L: Line + ?Sized>(line: &mut L, id: &str, released: &AtomicBool) {
    if let Err(error) = line.release() {
        tracing::warn!(button = %id, ?error, "failed to release line");
    }
    released.store(true, Ordering::Release);
}

/// Installs the edge handler of an evented line. Edges arriving after this
/// returns are not lost.
pub(crate) fn subscribe(line: &mut dyn EventLine, sink: PressSink) -> Result<(), LineError> {
    line.subscribe(Box::new(move |event: EdgeEvent| {
        sink.offer(event.level, event.timestamp);
    }))
}

/// Watch activity for a subscribed evented line: the edge handler does the
/// work, this only keeps the line until cancellation and then releases it.
pub(crate) async fn hold_line(
    mut line: Box<dyn EventLine>,
    id: Arc<str>,
    token: CancellationToken,
    released: Arc<AtomicBool>,
) -> Arc<str> {
    token.cancelled().await;

    // releasing may wait for an in-flight handler
    let button = id.clone();
    let flag = released.clone();
    let releasing = tokio::task::spawn_blocking(move || release_line(&mut *line, &button, &flag));
    if let Err(error) = releasing.await {
        tracing::error!(button = %id, ?error, "releasing line panicked");
        released.store(true, Ordering::Release);
    }
    tracing::debug!(button = %id, "stopped watching");
    id
}

/// Runs the callback once per accepted press, in acceptance order. Each call
/// runs on the blocking pool, so a panicking callback only fails its own task.
pub(crate) async fn dispatch(
    id: Arc<str>,
    callback: ButtonCallback,
    mut presses: mpsc::UnboundedReceiver<Duration>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => { return; },
            Some(timestamp) = presses.recv() => {
                let callback = callback.clone();
                let button = id.clone();
                match tokio::task::spawn_blocking(move || callback(&*button)).await {
                    Ok(()) => tracing::trace!(button = %id, ?timestamp, "callback done"),
                    Err(error) if error.is_panic() => {
                        tracing::error!(button = %id, ?timestamp, "button callback panicked");
                    }
                    Err(error) => tracing::warn!(button = %id, ?error, "button callback was cancelled"),
                }
            },
            else => { return; },
        }
    }
}
