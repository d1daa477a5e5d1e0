//! Readiness waiting
//!
//! Turns a stream of watch events for one resource into a single outcome.
//! Events describing a previous generation are ignored: their conditions
//! refer to the old spec. A `Ready=False` only becomes terminal once it has
//! persisted for the wait window, since the control plane often reports
//! transient failures while a revision starts up.

use std::time::Duration;

use futures::StreamExt;
use knctl_core::resources::{ConditionStatus, Conditioned};
use tokio::time::Instant;

use crate::error::{KubeError, Result};
use crate::gateway::{EventStream, WatchEvent};

/// Receives each new condition message observed while waiting
pub type MessageCallback<'a> = dyn for<'m> Fn(&'m str) + Send + Sync + 'a;

/// Default time to wait for readiness
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default persistence window for `Ready=False`
pub const DEFAULT_WAIT_WINDOW: Duration = Duration::from_secs(2);

/// Waiting parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Overall deadline
    pub timeout: Duration,
    /// How long `Ready=False` must persist before it is reported
    pub window: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            window: DEFAULT_WAIT_WINDOW,
        }
    }
}

impl WaitConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Result of a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Failed { reason: String, message: String },
    TimedOut,
}

impl WaitOutcome {
    /// Convert a non-ready outcome into the matching error
    pub fn into_result(self, name: &str, timeout: Duration) -> Result<()> {
        match self {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::Failed { reason, message } => Err(KubeError::ReadinessFailed {
                name: name.to_string(),
                reason,
                message,
            }),
            WaitOutcome::TimedOut => Err(KubeError::Timeout {
                operation: format!("waiting for '{name}' to become ready"),
                seconds: timeout.as_secs(),
            }),
        }
    }
}

/// Observation state between events
#[derive(Debug)]
struct ReadinessState {
    window: Duration,
    last_reason: Option<String>,
    pending_failure: Option<(Instant, String, String)>,
}

impl ReadinessState {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_reason: None,
            pending_failure: None,
        }
    }

    fn pending_deadline(&self) -> Option<Instant> {
        self.pending_failure.as_ref().map(|(deadline, _, _)| *deadline)
    }

    fn take_failure(&mut self) -> Option<WaitOutcome> {
        self.pending_failure
            .take()
            .map(|(_, reason, message)| WaitOutcome::Failed { reason, message })
    }

    /// Outcome when the deadline passes or the stream ends
    fn finish(&mut self) -> WaitOutcome {
        self.take_failure().unwrap_or(WaitOutcome::TimedOut)
    }

    fn observe<K: Conditioned>(
        &mut self,
        event: WatchEvent<K>,
        now: Instant,
        on_message: &MessageCallback<'_>,
    ) -> Option<WaitOutcome> {
        let object = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => object,
            WatchEvent::Deleted(_) => {
                return Some(WaitOutcome::Failed {
                    reason: "Deleted".to_string(),
                    message: "the resource was deleted while waiting".to_string(),
                });
            }
            WatchEvent::Error(message) => {
                tracing::debug!(%message, "watch error while waiting");
                return None;
            }
        };

        if !object.is_generation_observed() {
            tracing::trace!(
                generation = ?kube::Resource::meta(&object).generation,
                observed = ?object.observed_generation(),
                "ignoring status of a previous generation"
            );
            return None;
        }

        let ready = object.ready_condition()?;
        let reason = ready.reason.clone().unwrap_or_default();
        let message = ready.message.clone().unwrap_or_default();

        match ready.status {
            ConditionStatus::True => Some(WaitOutcome::Ready),
            ConditionStatus::False if self.window.is_zero() => {
                Some(WaitOutcome::Failed { reason, message })
            }
            ConditionStatus::False => {
                self.report(&reason, &message, on_message);
                if self.pending_failure.is_none() {
                    self.pending_failure = Some((now + self.window, reason, message));
                }
                None
            }
            ConditionStatus::Unknown => {
                self.pending_failure = None;
                self.report(&reason, &message, on_message);
                None
            }
        }
    }

    fn report(&mut self, reason: &str, message: &str, on_message: &MessageCallback<'_>) {
        if reason.is_empty() || self.last_reason.as_deref() == Some(reason) {
            return;
        }
        self.last_reason = Some(reason.to_string());
        on_message(if message.is_empty() { reason } else { message });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Drive a readiness wait over an event stream
///
/// `on_message` receives each new non-ready reason's message once.
pub async fn wait_for_ready<K: Conditioned + Send>(
    mut events: EventStream<K>,
    config: &WaitConfig,
    on_message: &MessageCallback<'_>,
) -> WaitOutcome {
    let deadline = Instant::now() + config.timeout;
    let mut state = ReadinessState::new(config.window);

    loop {
        let pending = state.pending_deadline();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return state.finish(),
            _ = sleep_until_opt(pending) => {
                if let Some(outcome) = state.take_failure() {
                    return outcome;
                }
            }
            event = events.next() => match event {
                None => return state.finish(),
                Some(event) => {
                    if let Some(outcome) = state.observe(event, Instant::now(), on_message) {
                        return outcome;
                    }
                }
            }
        }
    }
}

/// Wait until a `Deleted` event arrives
pub async fn wait_for_deletion<K: Send>(
    mut events: EventStream<K>,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let deleted = async {
        while let Some(event) = events.next().await {
            if matches!(event, WatchEvent::Deleted(_)) {
                return true;
            }
        }
        false
    };
    match tokio::time::timeout(timeout, deleted).await {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(KubeError::Timeout {
            operation: format!("waiting for '{name}' to be deleted"),
            seconds: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use knctl_core::resources::{Condition, Service, ServiceStatus};
    use std::sync::{Arc, Mutex};

    fn service(generation: i64, observed: i64, status: ConditionStatus, reason: &str) -> Service {
        let mut service = Service::with_image("foo", "default", "img");
        service.metadata.generation = Some(generation);
        let mut ready = Condition::new("Ready", status);
        if !reason.is_empty() {
            ready = ready.with_reason(reason, format!("{reason} message"));
        }
        service.status = Some(ServiceStatus {
            observed_generation: Some(observed),
            conditions: vec![ready],
            ..Default::default()
        });
        service
    }

    /// Events followed by a stream that never ends
    fn open_stream(events: Vec<WatchEvent<Service>>) -> EventStream<Service> {
        stream::iter(events).chain(stream::pending()).boxed()
    }

    fn config() -> WaitConfig {
        WaitConfig::new(Duration::from_secs(30)).with_window(Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready() {
        let events = open_stream(vec![
            WatchEvent::Added(service(1, 1, ConditionStatus::Unknown, "")),
            WatchEvent::Modified(service(1, 1, ConditionStatus::True, "")),
        ]);
        let outcome = wait_for_ready(events, &config(), &|_: &str| {}).await;
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_never_ready() {
        let events = open_stream(vec![WatchEvent::Modified(service(
            2,
            1,
            ConditionStatus::True,
            "",
        ))]);
        let outcome = wait_for_ready(events, &config(), &|_: &str| {}).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_window() {
        let events = open_stream(vec![WatchEvent::Modified(service(
            1,
            1,
            ConditionStatus::False,
            "RevisionFailed",
        ))]);
        let outcome = wait_for_ready(events, &config(), &|_: &str| {}).await;
        assert_eq!(
            outcome,
            WaitOutcome::Failed {
                reason: "RevisionFailed".into(),
                message: "RevisionFailed message".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_within_window_is_forgiven() {
        let events = open_stream(vec![
            WatchEvent::Modified(service(1, 1, ConditionStatus::False, "Deploying")),
            WatchEvent::Modified(service(1, 1, ConditionStatus::Unknown, "Deploying")),
            WatchEvent::Modified(service(1, 1, ConditionStatus::True, "")),
        ]);
        let outcome = wait_for_ready(events, &config(), &|_: &str| {}).await;
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_fails_immediately() {
        let events = open_stream(vec![WatchEvent::Modified(service(
            1,
            1,
            ConditionStatus::False,
            "ImagePullBackOff",
        ))]);
        let config = config().with_window(Duration::ZERO);
        let outcome = wait_for_ready(events, &config, &|_: &str| {}).await;
        assert!(matches!(outcome, WaitOutcome::Failed { reason, .. } if reason == "ImagePullBackOff"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_times_out() {
        let events = stream::iter(vec![WatchEvent::Added(service(
            1,
            1,
            ConditionStatus::Unknown,
            "",
        ))])
        .boxed();
        let outcome = wait_for_ready(events, &config(), &|_: &str| {}).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_reported_once_per_reason() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let events = open_stream(vec![
            WatchEvent::Modified(service(1, 1, ConditionStatus::Unknown, "RevisionMissing")),
            WatchEvent::Modified(service(1, 1, ConditionStatus::Unknown, "RevisionMissing")),
            WatchEvent::Modified(service(1, 1, ConditionStatus::Unknown, "IngressNotConfigured")),
            WatchEvent::Modified(service(1, 1, ConditionStatus::True, "")),
        ]);
        let outcome = wait_for_ready(events, &config(), &move |m: &str| {
            sink.lock().unwrap().push(m.to_string())
        })
        .await;

        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "RevisionMissing message".to_string(),
                "IngressNotConfigured message".to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_deletion() {
        let events = open_stream(vec![WatchEvent::Deleted(service(1, 1, ConditionStatus::True, ""))]);
        wait_for_deletion(events, "foo", Duration::from_secs(5))
            .await
            .unwrap();

        let events = open_stream(vec![]);
        let err = wait_for_deletion(events, "foo", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Timeout { .. }));
    }

    #[test]
    fn test_outcome_into_result() {
        let timeout = Duration::from_secs(10);
        assert!(WaitOutcome::Ready.into_result("foo", timeout).is_ok());
        let err = WaitOutcome::TimedOut.into_result("foo", timeout).unwrap_err();
        assert!(err.to_string().contains("10s"));
        let err = WaitOutcome::Failed {
            reason: "RevisionFailed".into(),
            message: "boom".into(),
        }
        .into_result("foo", timeout)
        .unwrap_err();
        assert!(matches!(err, KubeError::ReadinessFailed { .. }));
    }
}
