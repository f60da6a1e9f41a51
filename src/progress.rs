//! Progress tracking for long-running backend actions.
//!
//! Several actions may run at once (the parallel install phases of `start`);
//! only the one with the highest priority is reported.  A numeric progress
//! (a download, say) overrides all of them until it completes.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::Serialize;
use tracing::debug;

use crate::events::{BackendEvent, EventBus};
use crate::{Error, Result};

/// What the backend is doing right now.  `max < 0` means indeterminate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendProgress {
    pub current: i64,
    pub max: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<SystemTime>,
}

impl BackendProgress {
    /// The "nothing in progress" value.
    pub fn idle() -> Self {
        Self {
            current: 1,
            max: 1,
            description: None,
            transition_time: None,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.max < 0
    }
}

impl Default for BackendProgress {
    fn default() -> Self {
        Self::idle()
    }
}

struct ActionEntry {
    id: u64,
    priority: u32,
    progress: BackendProgress,
}

#[derive(Default)]
struct TrackerState {
    numeric: Option<BackendProgress>,
    actions: Vec<ActionEntry>,
    next_id: u64,
    current: BackendProgress,
}

/// Tracks concurrent actions and publishes the most relevant one.
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<Mutex<TrackerState>>,
    events: EventBus,
}

impl ProgressTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The progress last published.
    pub fn current(&self) -> BackendProgress {
        self.lock().current.clone()
    }

    /// Set numeric progress; it is cleared once `current >= max`.
    pub fn numeric(&self, description: &str, current: i64, max: i64) {
        let mut state = self.lock();
        state.numeric = (current < max).then(|| BackendProgress {
            current,
            max,
            description: Some(description.to_string()),
            transition_time: Some(SystemTime::now()),
        });
        self.publish(state);
    }

    /// Run `fut` as a tracked action.  An error coming out of it is tagged
    /// with `description` unless an inner action already tagged it.
    pub async fn action<T, F>(&self, description: &str, priority: u32, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.actions.push(ActionEntry {
                id,
                priority,
                progress: BackendProgress {
                    current: 0,
                    max: -1,
                    description: Some(description.to_string()),
                    transition_time: Some(SystemTime::now()),
                },
            });
            self.publish(state);
            id
        };
        debug!(action = description, "progress: started");

        let _guard = ActionGuard { tracker: self, id };
        match fut.await {
            Ok(value) => {
                debug!(action = description, "progress: finished");
                Ok(value)
            }
            Err(e) => {
                debug!(action = description, error = %e, "progress: errored");
                Err(tag_error(e, description))
            }
        }
    }

    fn finish(&self, id: u64) {
        let mut state = self.lock();
        state.actions.retain(|a| a.id != id);
        self.publish(state);
    }

    fn publish(&self, mut state: MutexGuard<'_, TrackerState>) {
        let progress = if let Some(numeric) = &state.numeric {
            numeric.clone()
        } else {
            // Ties go to the most recently started action.
            state
                .actions
                .iter()
                .fold(None::<&ActionEntry>, |best, a| match best {
                    Some(b) if b.priority > a.priority => Some(b),
                    _ => Some(a),
                })
                .map(|a| a.progress.clone())
                .unwrap_or_else(BackendProgress::idle)
        };
        state.current = progress.clone();
        drop(state);
        self.events.emit(BackendEvent::Progress { progress });
    }
}

/// Removes the action entry even when the future is dropped mid-flight.
struct ActionGuard<'a> {
    tracker: &'a ProgressTracker,
    id: u64,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}

fn tag_error(err: Error, description: &str) -> Error {
    match err {
        Error::Step { .. } => err,
        other => Error::Step {
            description: description.to_string(),
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(EventBus::new())
    }

    #[test]
    fn idle_progress_is_complete() {
        assert_eq!(tracker().current(), BackendProgress::idle());
    }

    #[tokio::test]
    async fn highest_priority_action_wins() {
        let t = tracker();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let low = t.action("low", 10, async {
            rx.await.ok();
            Ok(())
        });
        let check = async {
            tokio::task::yield_now().await;
            t.action("high", 50, async {
                assert_eq!(t.current().description.as_deref(), Some("high"));
                Ok(())
            })
            .await?;
            assert_eq!(t.current().description.as_deref(), Some("low"));
            tx.send(()).ok();
            Ok::<_, Error>(())
        };
        let (a, b) = tokio::join!(low, check);
        a.unwrap();
        b.unwrap();
        assert_eq!(t.current(), BackendProgress::idle());
    }

    #[test]
    fn numeric_overrides_until_complete() {
        let t = tracker();
        t.numeric("Downloading", 10, 100);
        assert_eq!(t.current().current, 10);
        t.numeric("Downloading", 100, 100);
        assert_eq!(t.current(), BackendProgress::idle());
    }

    #[tokio::test]
    async fn innermost_description_is_kept() {
        let t = tracker();
        let err = t
            .action("outer", 10, async {
                t.action("inner", 10, async { Err::<(), _>(Error::NoVersionAvailable) })
                    .await
            })
            .await
            .unwrap_err();
        assert_eq!(err.step_description(), Some("inner"));
        assert!(matches!(err.root(), Error::NoVersionAvailable));
    }

    #[tokio::test]
    async fn progress_events_are_emitted() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let t = ProgressTracker::new(bus);
        t.action("step", 1, async { Ok(()) }).await.unwrap();

        let started = rx.recv().await.unwrap();
        assert!(matches!(
            started,
            BackendEvent::Progress { ref progress } if progress.is_indeterminate()
        ));
        let finished = rx.recv().await.unwrap();
        assert_eq!(
            finished,
            BackendEvent::Progress {
                progress: BackendProgress::idle()
            }
        );
    }
}
