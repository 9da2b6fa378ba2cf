//! Event fan-out from jobs to external observers.
//!
//! Jobs publish into an [`EventSink`] while holding their exclusive section.
//! The core drains the sink on a dispatcher task and hands each event to
//! [`Listeners::dispatch`], so observers never run inside a job's critical
//! section and are free to call back into the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state_machine::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    StateChanged(State),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub kind: EventKind,
}

impl JobEvent {
    pub fn new(job_id: Uuid, kind: EventKind) -> Self {
        Self { job_id, kind }
    }
}

/// Observer of job events. Callbacks run on the dispatcher task and should
/// return quickly or hand the work off.
pub trait JobListener: Send + Sync {
    fn job_created(&self, _id: Uuid) {}

    fn job_updated(&self, _id: Uuid) {}

    fn job_deleted(&self, _id: Uuid) {}

    fn on_state_changed(&self, _id: Uuid, _state: State) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of listeners.
#[derive(Default)]
pub struct Listeners {
    entries: Mutex<Vec<(ListenerId, Arc<dyn JobListener>)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver `event` to a snapshot of the registered listeners. The lock is
    /// released before any callback runs.
    pub fn dispatch(&self, event: &JobEvent) {
        let targets: Vec<Arc<dyn JobListener>> = {
            let entries = self.entries.lock();
            if entries.is_empty() {
                return;
            }
            entries.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in targets {
            match event.kind {
                EventKind::Created => listener.job_created(event.job_id),
                EventKind::Updated => listener.job_updated(event.job_id),
                EventKind::Deleted => listener.job_deleted(event.job_id),
                EventKind::StateChanged(state) => listener.on_state_changed(event.job_id, state),
            }
        }
    }
}

/// Publishing side handed to every job.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, job_id: Uuid, kind: EventKind) {
        if let Some(tx) = &self.tx
            && tx.send(JobEvent::new(job_id, kind)).is_err()
        {
            tracing::trace!(job_id = %job_id, "event dispatcher gone, dropping {kind:?}");
        }
    }
}

/// Drain `rx` into `listeners` until every sink is dropped.
pub async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<JobEvent>, listeners: Arc<Listeners>) {
    while let Some(event) = rx.recv().await {
        listeners.dispatch(&event);
    }
    tracing::debug!("event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl JobListener for Recorder {
        fn job_created(&self, _id: Uuid) {
            self.seen.lock().push("created".into());
        }

        fn job_updated(&self, _id: Uuid) {
            self.seen.lock().push("updated".into());
        }

        fn on_state_changed(&self, _id: Uuid, state: State) {
            self.seen.lock().push(format!("state:{state}"));
        }
    }

    /// Registers another listener from inside a callback.
    struct Grower {
        listeners: Arc<Listeners>,
        added: Mutex<bool>,
    }

    impl JobListener for Grower {
        fn job_created(&self, _id: Uuid) {
            let mut added = self.added.lock();
            if !*added {
                self.listeners.add(Arc::new(Recorder::default()));
                *added = true;
            }
        }
    }

    #[test]
    fn dispatch_routes_by_kind() {
        let listeners = Listeners::new();
        let recorder = Arc::new(Recorder::default());
        listeners.add(recorder.clone());

        let id = Uuid::new_v4();
        listeners.dispatch(&JobEvent::new(id, EventKind::Created));
        listeners.dispatch(&JobEvent::new(id, EventKind::StateChanged(State::Run)));
        listeners.dispatch(&JobEvent::new(id, EventKind::Updated));
        listeners.dispatch(&JobEvent::new(id, EventKind::Deleted));

        assert_eq!(
            *recorder.seen.lock(),
            vec!["created", "state:RUN", "updated"]
        );
    }

    #[test]
    fn removed_listener_gets_nothing() {
        let listeners = Listeners::new();
        let recorder = Arc::new(Recorder::default());
        let id = listeners.add(recorder.clone());
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));

        listeners.dispatch(&JobEvent::new(Uuid::new_v4(), EventKind::Created));
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let listeners = Arc::new(Listeners::new());
        listeners.add(Arc::new(Grower {
            listeners: listeners.clone(),
            added: Mutex::new(false),
        }));

        listeners.dispatch(&JobEvent::new(Uuid::new_v4(), EventKind::Created));
        assert_eq!(listeners.len(), 2);
    }

    #[tokio::test]
    async fn dispatcher_drains_until_sinks_drop() {
        let listeners = Arc::new(Listeners::new());
        let recorder = Arc::new(Recorder::default());
        listeners.add(recorder.clone());

        let (sink, rx) = EventSink::channel();
        let task = tokio::spawn(run_dispatcher(rx, listeners));
        let id = Uuid::new_v4();
        sink.publish(id, EventKind::Created);
        sink.publish(id, EventKind::StateChanged(State::Preprocessing));
        drop(sink);
        task.await.unwrap();

        assert_eq!(
            *recorder.seen.lock(),
            vec!["created", "state:PREPROCESSING"]
        );
    }

    #[test]
    fn detached_sink_drops_events() {
        EventSink::detached().publish(Uuid::new_v4(), EventKind::Updated);
    }
}
