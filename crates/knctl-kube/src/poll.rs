//! Polling watcher
//!
//! Presents the event stream of a native watch on top of a plain fetch. A
//! worker task re-fetches the object every tick and synthesizes events by
//! comparing consecutive snapshots. A change of UID is a recreation and is
//! reported as `Deleted` followed by `Added`.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use kube::Resource;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::gateway::{EventStream, WatchEvent};

/// Default tick period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CHANNEL_CAPACITY: usize = 16;

/// Events between two snapshots of the same named object
pub fn diff_snapshots<K: Resource + Clone>(previous: Option<&K>, current: Option<&K>) -> Vec<WatchEvent<K>> {
    match (previous, current) {
        (None, None) => vec![],
        (None, Some(current)) => vec![WatchEvent::Added(current.clone())],
        (Some(previous), None) => vec![WatchEvent::Deleted(previous.clone())],
        (Some(previous), Some(current)) => {
            let (prev, cur) = (previous.meta(), current.meta());
            if prev.uid != cur.uid {
                vec![
                    WatchEvent::Deleted(previous.clone()),
                    WatchEvent::Added(current.clone()),
                ]
            } else if prev.resource_version != cur.resource_version {
                vec![WatchEvent::Modified(current.clone())]
            } else {
                vec![]
            }
        }
    }
}

/// Worker-backed watch emulation
///
/// Dropping the watcher, or the stream made by [`PollingWatcher::into_stream`],
/// ends the worker at its next suspension point.
pub struct PollingWatcher<K> {
    events: mpsc::Receiver<WatchEvent<K>>,
    stop: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl<K> PollingWatcher<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Start polling `fetch` every `interval`
    ///
    /// `fetch` returns `Ok(None)` when the object does not exist.
    pub fn start<F, Fut>(mut fetch: F, interval: Duration) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<K>>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen: Option<K> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                let fetched = tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    fetched = fetch() => fetched,
                };

                let events = match fetched {
                    Ok(current) => {
                        let events = diff_snapshots(last_seen.as_ref(), current.as_ref());
                        last_seen = current;
                        events
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "poll fetch failed");
                        vec![WatchEvent::Error(e.to_string())]
                    }
                };

                for event in events {
                    tokio::select! {
                        biased;
                        _ = &mut stop_rx => return,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            tracing::trace!("poll worker stopped");
        });

        Self {
            events: rx,
            stop: Some(stop_tx),
            worker: Some(worker),
        }
    }

    /// Next event, `None` once the worker has exited
    pub async fn next_event(&mut self) -> Option<WatchEvent<K>> {
        self.events.recv().await
    }

    /// Stop the worker and wait for it to exit
    ///
    /// After this returns the channel is closed: buffered events can still
    /// be drained, then [`PollingWatcher::next_event`] yields `None`.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            tracing::debug!(error = %e, "poll worker ended abnormally");
        }
    }

    /// Convert into a boxed event stream
    pub fn into_stream(self) -> EventStream<K> {
        futures::stream::unfold(self, |mut watcher| async move {
            watcher.next_event().await.map(|event| (event, watcher))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KubeError;
    use knctl_core::resources::Service;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn snapshot(uid: &str, version: &str) -> Service {
        let mut service = Service::with_image("foo", "default", "img");
        service.metadata.uid = Some(uid.to_string());
        service.metadata.resource_version = Some(version.to_string());
        service
    }

    fn label(event: &WatchEvent<Service>) -> String {
        match event {
            WatchEvent::Added(s) => format!("Added({})", s.metadata.uid.clone().unwrap_or_default()),
            WatchEvent::Modified(s) => {
                format!("Modified({})", s.metadata.uid.clone().unwrap_or_default())
            }
            WatchEvent::Deleted(s) => {
                format!("Deleted({})", s.metadata.uid.clone().unwrap_or_default())
            }
            WatchEvent::Error(_) => "Error".to_string(),
        }
    }

    /// Watcher over a fixed sequence of fetch results, then absent forever
    fn scripted(results: Vec<Result<Option<Service>>>) -> PollingWatcher<Service> {
        let queue = Arc::new(Mutex::new(VecDeque::from(results)));
        PollingWatcher::start(
            move || {
                let next = queue.lock().unwrap().pop_front();
                async move { next.unwrap_or(Ok(None)) }
            },
            DEFAULT_POLL_INTERVAL,
        )
    }

    #[test]
    fn test_diff_table() {
        let a1 = snapshot("a", "1");
        let a2 = snapshot("a", "2");
        let b1 = snapshot("b", "1");

        assert!(diff_snapshots::<Service>(None, None).is_empty());
        assert_eq!(diff_snapshots(None, Some(&a1)), vec![WatchEvent::Added(a1.clone())]);
        assert_eq!(diff_snapshots(Some(&a1), None), vec![WatchEvent::Deleted(a1.clone())]);
        assert!(diff_snapshots(Some(&a1), Some(&a1)).is_empty());
        assert_eq!(
            diff_snapshots(Some(&a1), Some(&a2)),
            vec![WatchEvent::Modified(a2.clone())]
        );
        assert_eq!(
            diff_snapshots(Some(&a2), Some(&b1)),
            vec![WatchEvent::Deleted(a2), WatchEvent::Added(b1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreation_detected() {
        let mut watcher = scripted(vec![
            Ok(Some(snapshot("A", "1"))),
            Ok(Some(snapshot("A", "1"))),
            Ok(Some(snapshot("B", "1"))),
            Ok(Some(snapshot("B", "1"))),
        ]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = watcher.next_event().await.unwrap();
            seen.push(label(&event));
        }
        assert_eq!(seen, vec!["Added(A)", "Deleted(A)", "Added(B)"]);

        // the fifth poll reports B gone
        let event = watcher.next_event().await.unwrap();
        assert_eq!(label(&event), "Deleted(B)");
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_becomes_error_event() {
        let mut watcher = scripted(vec![
            Err(KubeError::Transient {
                message: "connection reset".into(),
            }),
            Ok(Some(snapshot("A", "1"))),
        ]);

        assert!(matches!(
            watcher.next_event().await,
            Some(WatchEvent::Error(message)) if message.contains("connection reset")
        ));
        assert_eq!(
            label(&watcher.next_event().await.unwrap()),
            "Added(A)"
        );
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_channel() {
        let mut watcher = scripted(vec![]);
        watcher.stop().await;
        while watcher.next_event().await.is_some() {}
        assert!(watcher.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_into_stream() {
        let watcher = scripted(vec![Ok(Some(snapshot("A", "1"))), Ok(Some(snapshot("A", "2")))]);
        let events: Vec<_> = watcher.into_stream().take(2).map(|e| label(&e)).collect().await;
        assert_eq!(events, vec!["Added(A)", "Modified(A)"]);
    }
}
