//! Request/response correlator
//!
//! Associates an outbound command with the bytes that arrive during a
//! bounded wait window. At most one capture is active per correlator:
//! - [`SingleFlight::Queue`] callers wait their turn
//! - [`SingleFlight::FailFast`] callers get `None` while one is in flight
//!
//! Captures carry no response tagging. Everything delivered while a
//! capture is active lands in its buffer, so pipelining several commands
//! into one window is not supported.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::time::Instant;

/// Stand-in deadline for windows too long to add to a clock reading
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How a send-and-wait decides it is done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Always wait the full window
    #[default]
    Fixed,
    /// Return as soon as the resolver recognises the reply, with the
    /// window as upper bound
    UntilResponse,
}

/// What a second concurrent send-and-wait does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleFlight {
    /// Wait for the in-flight capture to finish
    #[default]
    Queue,
    /// Fail immediately with `Busy`
    FailFast,
}

/// Why a capture wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The reply was recognised before the window elapsed
    ResponseReceived,
    /// The full window elapsed
    WindowElapsed,
    /// The capture was cancelled (session closing)
    Cancelled,
}

/// Bytes captured by one send-and-wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    /// Everything delivered during the window, in arrival order
    pub bytes: Bytes,
    /// How the wait ended
    pub outcome: WaitOutcome,
    /// Time spent waiting
    pub elapsed: Duration,
}

impl CaptureResult {
    /// Whether nothing arrived
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    active: bool,
    buffer: Vec<u8>,
    request: Bytes,
    complete: bool,
    cancelled: bool,
}

/// Single-flight capture window
#[derive(Debug, Default)]
pub struct Correlator {
    state: Mutex<CaptureState>,
    wake: Notify,
    gate: AsyncMutex<()>,
}

impl Correlator {
    /// Create an idle correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a capture for `request`.
    ///
    /// Returns `None` under [`SingleFlight::FailFast`] when another
    /// capture is in flight.
    pub async fn begin(&self, request: Bytes, policy: SingleFlight) -> Option<Capture<'_>> {
        let guard = match policy {
            SingleFlight::Queue => self.gate.lock().await,
            SingleFlight::FailFast => self.gate.try_lock().ok()?,
        };

        let mut state = self.state.lock();
        state.buffer.clear();
        state.request = request;
        state.complete = false;
        state.cancelled = false;
        state.active = true;
        drop(state);

        Some(Capture {
            correlator: self,
            _guard: guard,
            started: Instant::now(),
        })
    }

    /// Append inbound bytes to the active capture. Returns `false` when
    /// no capture is active.
    pub fn append(&self, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.active {
            state.buffer.extend_from_slice(data);
        }
        state.active
    }

    /// Run `is_complete(request, captured)` against the active capture and
    /// wake the waiter once it reports true
    pub fn check_completion(&self, is_complete: impl FnOnce(&[u8], &[u8]) -> bool) {
        let mut state = self.state.lock();
        if !state.active || state.complete {
            return;
        }
        if is_complete(&state.request, &state.buffer) {
            state.complete = true;
            drop(state);
            self.wake.notify_waiters();
        }
    }

    /// End the active capture early. The waiter returns its partial buffer.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        state.cancelled = true;
        drop(state);
        self.wake.notify_waiters();
    }

    /// Whether a capture is active
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }
}

/// An active capture. Holds the single-flight slot until finished or
/// dropped.
pub struct Capture<'a> {
    correlator: &'a Correlator,
    _guard: AsyncMutexGuard<'a, ()>,
    started: Instant,
}

impl Capture<'_> {
    /// Wait for the window to end. Never waits longer than `window`.
    pub async fn wait(&self, window: Duration, mode: WaitMode) -> WaitOutcome {
        let deadline = self
            .started
            .checked_add(window)
            .unwrap_or_else(|| self.started + FAR_FUTURE);
        let correlator = self.correlator;

        loop {
            let notified = correlator.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = correlator.state.lock();
                if state.cancelled {
                    return WaitOutcome::Cancelled;
                }
                if mode == WaitMode::UntilResponse && state.complete {
                    return WaitOutcome::ResponseReceived;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return WaitOutcome::WindowElapsed,
                _ = &mut notified => {}
            }
        }
    }

    /// Close the window and take the captured bytes
    pub fn finish(self, outcome: WaitOutcome) -> CaptureResult {
        let mut state = self.correlator.state.lock();
        state.active = false;
        let bytes = Bytes::from(std::mem::take(&mut state.buffer));
        CaptureResult {
            bytes,
            outcome,
            elapsed: self.started.elapsed(),
        }
    }
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        let mut state = self.correlator.state.lock();
        state.active = false;
        state.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_wait_takes_full_window() {
        let correlator = Correlator::new();
        let capture = correlator
            .begin(Bytes::from_static(&[1]), SingleFlight::Queue)
            .await
            .unwrap();

        assert!(correlator.append(&[0xAA]));
        correlator.check_completion(|_, _| true);

        let outcome = capture.wait(Duration::from_millis(200), WaitMode::Fixed).await;
        let result = capture.finish(outcome);

        assert_eq!(result.outcome, WaitOutcome::WindowElapsed);
        assert_eq!(result.bytes.as_ref(), &[0xAA]);
        assert!(result.elapsed >= Duration::from_millis(200));
        assert!(!correlator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_response_returns_early() {
        let correlator = Arc::new(Correlator::new());
        let capture = correlator
            .begin(Bytes::from_static(&[7]), SingleFlight::Queue)
            .await
            .unwrap();

        let feeder = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            feeder.append(&[1, 2]);
            feeder.check_completion(|req, cap| req == [7] && cap.len() >= 2);
        });

        let outcome = capture
            .wait(Duration::from_secs(5), WaitMode::UntilResponse)
            .await;
        let result = capture.finish(outcome);

        assert_eq!(result.outcome, WaitOutcome::ResponseReceived);
        assert_eq!(result.bytes.as_ref(), &[1, 2]);
        assert!(result.elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_wait() {
        let correlator = Arc::new(Correlator::new());
        let capture = correlator
            .begin(Bytes::new(), SingleFlight::Queue)
            .await
            .unwrap();

        let canceller = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.append(&[9]);
            canceller.cancel();
        });

        let outcome = capture.wait(Duration::from_secs(60), WaitMode::Fixed).await;
        let result = capture.finish(outcome);
        assert_eq!(result.outcome, WaitOutcome::Cancelled);
        assert_eq!(result.bytes.as_ref(), &[9]);
        assert!(result.elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_window_waits_for_cancel() {
        let correlator = Arc::new(Correlator::new());
        let capture = correlator
            .begin(Bytes::new(), SingleFlight::Queue)
            .await
            .unwrap();

        let canceller = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = capture.wait(Duration::MAX, WaitMode::Fixed).await;
        let result = capture.finish(outcome);
        assert_eq!(result.outcome, WaitOutcome::Cancelled);
        assert!(result.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fail_fast_while_in_flight() {
        let correlator = Correlator::new();
        let first = correlator.begin(Bytes::new(), SingleFlight::FailFast).await;
        assert!(first.is_some());

        assert!(correlator
            .begin(Bytes::new(), SingleFlight::FailFast)
            .await
            .is_none());

        drop(first);
        assert!(correlator
            .begin(Bytes::new(), SingleFlight::FailFast)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_bytes_outside_window_are_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.append(&[1, 2, 3]));

        let capture = correlator.begin(Bytes::new(), SingleFlight::Queue).await.unwrap();
        correlator.append(&[4]);
        let result = capture.finish(WaitOutcome::WindowElapsed);
        assert_eq!(result.bytes.as_ref(), &[4]);

        assert!(!correlator.append(&[5]));
        let capture = correlator.begin(Bytes::new(), SingleFlight::Queue).await.unwrap();
        let result = capture.finish(WaitOutcome::WindowElapsed);
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_without_capture_does_not_leak() {
        let correlator = Correlator::new();
        correlator.cancel();

        let capture = correlator.begin(Bytes::new(), SingleFlight::Queue).await.unwrap();
        let outcome = capture.wait(Duration::from_millis(1), WaitMode::Fixed).await;
        assert_eq!(outcome, WaitOutcome::WindowElapsed);
    }
}
