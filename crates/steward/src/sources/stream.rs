//! Push-stream client: connects to the server WebSocket and converts
//! live event messages into `SyncInput`s for the reconciler.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_core::types::ConnectionState;

use crate::api::parse_event;
use crate::reconciler::SyncInput;

/// Reconnect policy: exponential delay doubling from `base` up to
/// `cap`, giving up for good after `max_retries` consecutive
/// disconnections.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given the number of consecutive
    /// disconnections recorded so far (1-based). `None` means the
    /// policy is exhausted and no further attempt may be made.
    pub fn delay_after(&self, consecutive_failures: u32) -> Option<Duration> {
        if consecutive_failures >= self.max_retries {
            return None;
        }
        let exp = consecutive_failures.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(2u32.saturating_pow(exp));
        Some(delay.min(self.cap))
    }
}

/// Why the stream client's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    Cancelled,
    /// `max_retries` consecutive disconnections; the connection state
    /// was left at `Degraded`.
    RetriesExhausted,
}

/// Long-running WebSocket client with automatic reconnection.
pub struct StreamClient {
    tx: mpsc::Sender<SyncInput>,
    url: String,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl StreamClient {
    pub fn new(
        tx: mpsc::Sender<SyncInput>,
        url: String,
        backoff: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            url,
            backoff,
            cancel,
        }
    }

    /// Connect and listen until cancelled or the retry budget runs
    /// out. The failure counter resets to zero every time a
    /// connection is established, so only uninterrupted runs of
    /// disconnections count against `max_retries`.
    pub async fn run(&self) -> StreamExit {
        let mut consecutive_failures: u32 = 0;

        loop {
            self.send_state(ConnectionState::Connecting).await;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("stream: cancellation requested, shutting down");
                    self.send_state(ConnectionState::Disconnected).await;
                    return StreamExit::Cancelled;
                }
                result = self.connect_and_listen(&mut consecutive_failures) => result,
            };

            match result {
                Ok(()) => info!("stream: connection closed"),
                Err(e) => warn!("stream: connection error: {e}"),
            }
            consecutive_failures = consecutive_failures.saturating_add(1);
            // Degraded while failures accumulate; Disconnected is
            // reserved for an intentional stop.
            self.send_state(ConnectionState::Degraded).await;

            let Some(delay) = self.backoff.delay_after(consecutive_failures) else {
                warn!(
                    consecutive_failures,
                    "stream: retry budget exhausted, giving up"
                );
                return StreamExit::RetriesExhausted;
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("stream: cancellation during retry backoff");
                    self.send_state(ConnectionState::Disconnected).await;
                    return StreamExit::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {
                    info!(
                        url = %self.url,
                        delay_ms = delay.as_millis() as u64,
                        consecutive_failures,
                        "stream: reconnecting..."
                    );
                }
            }
        }
    }

    /// Single connection attempt: connect, then read messages until
    /// close or error. Resets the failure counter once connected.
    async fn connect_and_listen(&self, consecutive_failures: &mut u32) -> Result<(), String> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| e.to_string())?;
        info!(url = %self.url, "stream: connected");
        *consecutive_failures = 0;
        self.send_state(ConnectionState::Connected).await;

        let (_write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
                                self.dispatch(&text).await;
                            }
                        }
                        Some(Err(e)) => return Err(e.to_string()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Parse one wire message and forward it. Malformed messages are
    /// dropped individually; they never tear down the connection.
    async fn dispatch(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            debug!("stream: dropping non-JSON message");
            return;
        };
        let Some(event) = parse_event(&value) else {
            debug!("stream: dropping message without a usable event payload");
            return;
        };
        if let Err(e) = self.tx.send(SyncInput::StreamEvent(event)).await {
            warn!("stream: reconciler channel closed: {e}");
        }
    }

    async fn send_state(&self, state: ConnectionState) {
        let _ = self.tx.send(SyncInput::Connection(state)).await;
    }
}

/// Owns the stream client task and lets callers stop and restart it.
///
/// `run` gives up for good once the retry budget is spent; the
/// supervisor is what turns "explicit restart" into a fresh run with
/// a fresh failure counter. Each run gets a child token of the
/// pipeline token, so pipeline shutdown still tears the task down.
pub struct StreamSupervisor {
    tx: mpsc::Sender<SyncInput>,
    url: String,
    backoff: BackoffPolicy,
    parent: CancellationToken,
    current: Option<CancellationToken>,
}

impl StreamSupervisor {
    pub fn new(
        tx: mpsc::Sender<SyncInput>,
        url: String,
        backoff: BackoffPolicy,
        parent: CancellationToken,
    ) -> Self {
        Self {
            tx,
            url,
            backoff,
            parent,
            current: None,
        }
    }

    /// Whether a run is live. A run that exhausted its retry budget
    /// cancels its own token on exit, so this flips to false without
    /// an explicit `stop`.
    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Spawn a fresh run, superseding any previous one.
    pub fn start(&mut self) {
        self.stop();
        let token = self.parent.child_token();
        let client = StreamClient::new(
            self.tx.clone(),
            self.url.clone(),
            self.backoff,
            token.clone(),
        );
        self.current = Some(token.clone());
        tokio::spawn(async move {
            match client.run().await {
                StreamExit::Cancelled => info!("stream client stopped"),
                StreamExit::RetriesExhausted => {
                    warn!("stream client gave up; press r to reconnect");
                }
            }
            token.cancel();
        });
    }

    /// Cancel the current run, if any. The client sends
    /// `Disconnected` on its way out.
    pub fn stop(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn active_token(&self) -> Option<CancellationToken> {
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_secs: u64, cap_secs: u64, max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(base_secs),
            cap: Duration::from_secs(cap_secs),
            max_retries,
        }
    }

    #[test]
    fn delay_doubles_from_base() {
        let p = policy(3, 60, 10);
        assert_eq!(p.delay_after(1), Some(Duration::from_secs(3)));
        assert_eq!(p.delay_after(2), Some(Duration::from_secs(6)));
        assert_eq!(p.delay_after(3), Some(Duration::from_secs(12)));
        assert_eq!(p.delay_after(4), Some(Duration::from_secs(24)));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy(3, 60, 100);
        assert_eq!(p.delay_after(6), Some(Duration::from_secs(60)));
        assert_eq!(p.delay_after(50), Some(Duration::from_secs(60)));
    }

    #[test]
    fn exhausted_after_max_retries() {
        let p = policy(3, 60, 3);
        assert!(p.delay_after(1).is_some());
        assert!(p.delay_after(2).is_some());
        assert_eq!(p.delay_after(3), None);
    }

    /// With max_retries = 3, three consecutive disconnections use up
    /// the budget: two backoff waits, then no further attempt.
    #[test]
    fn three_disconnects_mean_three_attempts_total() {
        let p = policy(1, 60, 3);
        let mut attempts = 1; // the initial connection
        let mut failures = 0u32;
        loop {
            failures += 1; // a disconnection
            match p.delay_after(failures) {
                Some(_) => attempts += 1,
                None => break,
            }
        }
        assert_eq!(attempts, 3);
        assert_eq!(failures, 3);
    }

    #[test]
    fn huge_failure_count_does_not_overflow() {
        let p = policy(3, 60, u32::MAX);
        assert_eq!(p.delay_after(u32::MAX - 1), Some(Duration::from_secs(60)));
    }

    // Nothing listens on this port, so every connect attempt fails
    // straight away.
    const UNREACHABLE_URL: &str = "ws://127.0.0.1:9";

    /// Drive the full run loop against an unreachable endpoint:
    /// with a budget of 3 the loop makes exactly three connection
    /// attempts, leaves the connection Degraded, and reports that it
    /// gave up rather than cancelled.
    #[tokio::test(start_paused = true)]
    async fn run_ends_degraded_after_retry_budget() {
        let (tx, mut rx) = mpsc::channel(64);
        let client = StreamClient::new(
            tx,
            UNREACHABLE_URL.into(),
            policy(1, 60, 3),
            CancellationToken::new(),
        );

        let exit = client.run().await;
        assert_eq!(exit, StreamExit::RetriesExhausted);

        let mut states = Vec::new();
        while let Ok(input) = rx.try_recv() {
            if let SyncInput::Connection(state) = input {
                states.push(state);
            }
        }
        assert_eq!(states.last(), Some(&ConnectionState::Degraded));
        let attempts = states
            .iter()
            .filter(|s| **s == ConnectionState::Connecting)
            .count();
        assert_eq!(attempts, 3);
        assert!(!states.contains(&ConnectionState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_reports_disconnected() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let client = StreamClient::new(
            tx,
            UNREACHABLE_URL.into(),
            policy(60, 60, 10),
            cancel.clone(),
        );

        let run = tokio::spawn(async move { client.run().await });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(run.await.unwrap(), StreamExit::Cancelled);

        let mut last = None;
        while let Ok(input) = rx.try_recv() {
            if let SyncInput::Connection(state) = input {
                last = Some(state);
            }
        }
        assert_eq!(last, Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn supervisor_restarts_after_stop() {
        let (tx, _rx) = mpsc::channel(16);
        let mut sup = StreamSupervisor::new(
            tx,
            UNREACHABLE_URL.into(),
            BackoffPolicy::default(),
            CancellationToken::new(),
        );
        assert!(!sup.is_running());

        sup.start();
        assert!(sup.is_running());

        sup.stop();
        assert!(!sup.is_running());

        sup.start();
        assert!(sup.is_running());
    }

    #[tokio::test]
    async fn supervisor_start_supersedes_previous_run() {
        let (tx, _rx) = mpsc::channel(16);
        let mut sup = StreamSupervisor::new(
            tx,
            UNREACHABLE_URL.into(),
            BackoffPolicy::default(),
            CancellationToken::new(),
        );
        sup.start();
        let first = sup.active_token().unwrap();
        sup.start();
        assert!(first.is_cancelled());
        assert!(sup.is_running());
    }
}
