//! The notification dispatcher delivers [ResourceEvent]s and queued tasks on a single dedicated
//! thread.
//!
//! Mutations publish while they hold the graph's write section. Recipients are resolved at that
//! moment, so a registration only ever sees events published after it was made. Delivery happens
//! later, off the mutating call stack, which lets listeners mutate the graph themselves. All jobs
//! share one FIFO queue: the delivery order is the publish order, for every listener. The events
//! of one batch are queued back to back, so a task submitted while one of them is delivered runs
//! after the whole batch.
use enumset::EnumSet;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
    config::DispatcherConfig,
    error::PatternError,
    event::{ResourceEvent, StructureEventKind},
    properties::{ConsumerId, IdSource, ListenerId, ResourceId},
};

pub type Listener = Arc<dyn Fn(&ResourceEvent) + Send + Sync>;

/// Process-wide channel receiving panics raised by listeners and tasks.
pub trait FaultSink: Send + Sync {
    fn report(&self, context: &str, message: &str);
}

/// Default [FaultSink]: logs the fault and carries on.
#[derive(Debug, Default)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, context: &str, message: &str) {
        tracing::error!("Listener fault in {context}: {message}");
    }
}

/// What a registration listens to. Structure scopes only accept the kinds in their set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Structure {
        resource: ResourceId,
        kinds: EnumSet<StructureEventKind>,
    },
    Value {
        resource: ResourceId,
        every_update: bool,
    },
    AccessMode {
        resource: ResourceId,
        consumer: Option<ConsumerId>,
    },
    /// Structure events of the whole graph.
    AllStructure { kinds: EnumSet<StructureEventKind> },
}

impl Scope {
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Scope::Structure { resource, .. } => Some(*resource),
            Scope::Value { resource, .. } => Some(*resource),
            Scope::AccessMode { resource, .. } => Some(*resource),
            Scope::AllStructure { .. } => None,
        }
    }

    fn accepts(&self, event: &ResourceEvent) -> bool {
        match (self, event) {
            (
                Scope::Structure { kinds, .. } | Scope::AllStructure { kinds },
                ResourceEvent::Structure { .. },
            ) => event.is_structure_in(*kinds),
            (Scope::Value { every_update, .. }, ResourceEvent::Value { changed, .. }) => {
                *changed || *every_update
            }
            (
                Scope::AccessMode { consumer, .. },
                ResourceEvent::AccessModeChanged {
                    consumer: event_consumer,
                    ..
                },
            ) => consumer.map(|c| c == *event_consumer).unwrap_or(true),
            _ => false,
        }
    }
}

struct Registration {
    scope: Scope,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<ListenerId, Registration>,
    by_resource: BTreeMap<ResourceId, BTreeSet<ListenerId>>,
    global: BTreeSet<ListenerId>,
}

impl Registry {
    fn insert(&mut self, id: ListenerId, registration: Registration) {
        match registration.scope.resource() {
            Some(resource) => {
                self.by_resource.entry(resource).or_default().insert(id);
            }
            None => {
                self.global.insert(id);
            }
        }
        self.entries.insert(id, registration);
    }

    fn remove(&mut self, id: &ListenerId) -> Option<Registration> {
        let registration = self.entries.remove(id)?;
        match registration.scope.resource() {
            Some(resource) => {
                if let Some(ids) = self.by_resource.get_mut(&resource) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.by_resource.remove(&resource);
                    }
                }
            }
            None => {
                self.global.remove(id);
            }
        }
        Some(registration)
    }

    fn recipients(
        &self,
        event: &ResourceEvent,
        targets: &[ResourceId],
    ) -> Vec<(ListenerId, Listener)> {
        let mut found = BTreeMap::new();
        let scoped = targets
            .iter()
            .filter_map(|target| self.by_resource.get(target))
            .flatten();
        for id in scoped.chain(self.global.iter()) {
            if let Some(registration) = self.entries.get(id) {
                if registration.scope.accepts(event) {
                    found.insert(*id, registration.listener.clone());
                }
            }
        }
        found.into_iter().collect()
    }
}

/// A unit of work for the dispatch thread.
pub enum Job {
    Deliver {
        event: ResourceEvent,
        recipients: Vec<(ListenerId, Listener)>,
    },
    Task {
        label: String,
        task: Box<dyn FnOnce() + Send>,
    },
    Shutdown,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Deliver { event, recipients } => {
                let ids: Vec<u64> = recipients.iter().map(|(id, _)| id.0).collect();
                write!(f, "Deliver({event} -> {ids:?})")
            }
            Job::Task { label, .. } => write!(f, "Task({label})"),
            Job::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    pending: Mutex<usize>,
    idle: Condvar,
    faults: RwLock<Arc<dyn FaultSink>>,
}

impl Shared {
    fn is_registered(&self, id: &ListenerId) -> bool {
        self.registry.lock().entries.contains_key(id)
    }

    fn finish_job(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn run_guarded<F: FnOnce()>(&self, context: &str, f: F) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            let sink = self.faults.read().clone();
            sink.report(context, &message);
        }
    }

    fn run(&self, mut receiver: UnboundedReceiver<Job>) {
        while let Some(job) = receiver.blocking_recv() {
            let shutdown = matches!(job, Job::Shutdown);
            match job {
                Job::Deliver { event, recipients } => {
                    for (id, listener) in recipients {
                        if !self.is_registered(&id) {
                            tracing::trace!("Skipping {event} for removed listener {}", id.0);
                            continue;
                        }
                        tracing::trace!("Delivering {event} to listener {}", id.0);
                        self.run_guarded(&format!("listener {} ({event})", id.0), || {
                            listener(&event)
                        });
                    }
                }
                Job::Task { label, task } => {
                    tracing::trace!("Running task {label}");
                    self.run_guarded(&label, task);
                }
                Job::Shutdown => {}
            }
            self.finish_job();
            if shutdown {
                break;
            }
        }
        tracing::debug!("Dispatch loop stopped");
    }
}

pub struct Dispatcher {
    sender: UnboundedSender<Job>,
    shared: Arc<Shared>,
    ids: IdSource,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    warn_threshold: usize,
    backlog_warned: AtomicBool,
    /// Held while queueing, keeps batches contiguous.
    queueing: Mutex<()>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("thread_id", &self.thread_id)
            .field("backlog", &self.backlog())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Dispatcher, PatternError> {
        let (sender, receiver) = unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            faults: RwLock::new(Arc::new(LogFaultSink)),
        });
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || loop_shared.run(receiver))?;
        let thread_id = handle.thread().id();
        Ok(Dispatcher {
            sender,
            shared,
            ids: IdSource::default(),
            thread: Mutex::new(Some(handle)),
            thread_id,
            warn_threshold: config.queue_warn_threshold,
            backlog_warned: AtomicBool::new(false),
            queueing: Mutex::new(()),
        })
    }

    pub fn set_fault_sink(&self, sink: Arc<dyn FaultSink>) {
        *self.shared.faults.write() = sink;
    }

    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Number of queued or running jobs.
    pub fn backlog(&self) -> usize {
        *self.shared.pending.lock()
    }

    pub fn add_listener(&self, scope: Scope, listener: Listener) -> ListenerId {
        let id = ListenerId(self.ids.next());
        self.shared
            .registry
            .lock()
            .insert(id, Registration { scope, listener });
        id
    }

    /// Removes a registration. Returns false if it did not exist. A delivery that already started
    /// is not interrupted.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.registry.lock().remove(&id).is_some()
    }

    /// Removes a registration only if its scope satisfies `matches`.
    pub(crate) fn remove_listener_if<F>(&self, id: ListenerId, matches: F) -> bool
    where
        F: Fn(&Scope) -> bool,
    {
        let mut registry = self.shared.registry.lock();
        match registry.entries.get(&id) {
            Some(registration) if matches(&registration.scope) => registry.remove(&id).is_some(),
            _ => false,
        }
    }

    /// Enqueues `event` for every registration on one of `targets` (plus global structure
    /// listeners) that accepts it.
    pub fn publish(&self, event: ResourceEvent, targets: &[ResourceId]) -> Result<(), PatternError> {
        let _queueing = self.queueing.lock();
        self.deliver(event, targets)
    }

    /// Publishes the events of one graph mutation. No task or other batch is queued in between.
    pub fn publish_batch<I>(&self, batch: I) -> Result<(), PatternError>
    where
        I: IntoIterator<Item = (ResourceEvent, Vec<ResourceId>)>,
    {
        let _queueing = self.queueing.lock();
        for (event, targets) in batch {
            self.deliver(event, &targets)?;
        }
        Ok(())
    }

    fn deliver(&self, event: ResourceEvent, targets: &[ResourceId]) -> Result<(), PatternError> {
        let recipients = self.shared.registry.lock().recipients(&event, targets);
        if recipients.is_empty() {
            tracing::trace!("No recipients for {event}");
            return Ok(());
        }
        self.enqueue(Job::Deliver { event, recipients })
    }

    /// Runs `task` on the dispatch thread after every job queued so far.
    pub fn submit<F>(&self, label: &str, task: F) -> Result<(), PatternError>
    where
        F: FnOnce() + Send + 'static,
    {
        let _queueing = self.queueing.lock();
        self.enqueue(Job::Task {
            label: label.to_string(),
            task: Box::new(task),
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), PatternError> {
        let backlog = {
            let mut pending = self.shared.pending.lock();
            *pending += 1;
            *pending
        };
        if backlog > self.warn_threshold {
            if !self.backlog_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Dispatch backlog at {backlog} jobs (warn threshold {})",
                    self.warn_threshold
                );
            }
        } else {
            self.backlog_warned.store(false, Ordering::Relaxed);
        }
        if let Err(err) = self.sender.send(job) {
            self.shared.finish_job();
            return Err(err.into());
        }
        Ok(())
    }

    /// Blocks until the queue is drained and no job is running, or until `timeout` passes. Returns
    /// whether the dispatcher is idle. Waiting from the dispatch thread itself would never finish
    /// and is rejected.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool, PatternError> {
        if self.is_dispatch_thread() {
            return Err(PatternError::Dispatch(
                "wait_idle called from the dispatch thread".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self
                .shared
                .idle
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return Ok(*pending == 0);
            }
        }
        Ok(true)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.enqueue(Job::Shutdown).is_err() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if self.is_dispatch_thread() {
                // dropped from inside a listener; the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Dispatch thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::StructureEventKind, paths::ResourcePath};
    use test_log::test;

    fn structure_event(resource: u64) -> ResourceEvent {
        ResourceEvent::Structure {
            kind: StructureEventKind::Activated,
            resource: ResourceId(resource),
            path: ResourcePath::top_level(&format!("r{resource}")).unwrap(),
            related: None,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<ResourceId>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |event: &ResourceEvent| {
            sink.lock().push(event.resource());
        });
        (seen, listener)
    }

    #[test]
    fn delivers_in_publish_order() {
        let dispatcher = Dispatcher::new(&DispatcherConfig::default()).unwrap();
        let (seen, listener) = recorder();
        dispatcher.add_listener(Scope::AllStructure { kinds: EnumSet::all() }, listener);
        for i in 0..50 {
            dispatcher.publish(structure_event(i), &[ResourceId(i)]).unwrap();
        }
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        let expected: Vec<ResourceId> = (0..50).map(ResourceId).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn tasks_submitted_during_a_batch_run_after_it() {
        let dispatcher = Arc::new(Dispatcher::new(&DispatcherConfig::default()).unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (sink, weak) = (order.clone(), Arc::downgrade(&dispatcher));
        let listener: Listener = Arc::new(move |event: &ResourceEvent| {
            sink.lock().push(format!("event {}", event.resource().0));
            if event.resource() == ResourceId(0) {
                let (sink, dispatcher) = (sink.clone(), weak.upgrade().unwrap());
                dispatcher
                    .submit("after batch", move || sink.lock().push("task".to_string()))
                    .unwrap();
            }
        });
        dispatcher.add_listener(Scope::AllStructure { kinds: EnumSet::all() }, listener);
        let batch: Vec<(ResourceEvent, Vec<ResourceId>)> = (0..20)
            .map(|i| (structure_event(i), vec![ResourceId(i)]))
            .collect();
        dispatcher.publish_batch(batch).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        let order = order.lock();
        assert_eq!(order.len(), 21);
        assert_eq!(order.last().map(String::as_str), Some("task"));
    }

    #[test]
    fn scoped_listeners_only_see_their_resource() {
        let dispatcher = Dispatcher::new(&DispatcherConfig::default()).unwrap();
        let (seen, listener) = recorder();
        let id = dispatcher.add_listener(
            Scope::Structure {
                resource: ResourceId(2),
                kinds: EnumSet::all(),
            },
            listener,
        );
        dispatcher.publish(structure_event(1), &[ResourceId(1)]).unwrap();
        dispatcher.publish(structure_event(2), &[ResourceId(2)]).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(*seen.lock(), vec![ResourceId(2)]);

        assert!(dispatcher.remove_listener(id));
        assert!(!dispatcher.remove_listener(id));
        dispatcher.publish(structure_event(2), &[ResourceId(2)]).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn structure_scopes_filter_by_kind() {
        let dispatcher = Dispatcher::new(&DispatcherConfig::default()).unwrap();
        let (scoped, listener) = recorder();
        dispatcher.add_listener(
            Scope::Structure {
                resource: ResourceId(3),
                kinds: StructureEventKind::Deleted.into(),
            },
            listener,
        );
        let (global, listener) = recorder();
        dispatcher.add_listener(
            Scope::AllStructure {
                kinds: StructureEventKind::Created | StructureEventKind::Deleted,
            },
            listener,
        );
        let created = ResourceEvent::Structure {
            kind: StructureEventKind::Created,
            resource: ResourceId(3),
            path: ResourcePath::top_level("r3").unwrap(),
            related: None,
        };
        let deleted = ResourceEvent::Structure {
            kind: StructureEventKind::Deleted,
            resource: ResourceId(3),
            path: ResourcePath::top_level("r3").unwrap(),
            related: None,
        };
        dispatcher.publish(created, &[ResourceId(3)]).unwrap();
        dispatcher.publish(structure_event(3), &[ResourceId(3)]).unwrap();
        dispatcher.publish(deleted, &[ResourceId(3)]).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(*scoped.lock(), vec![ResourceId(3)]);
        assert_eq!(*global.lock(), vec![ResourceId(3), ResourceId(3)]);
    }

    #[test]
    fn unchanged_values_need_every_update() {
        let dispatcher = Dispatcher::new(&DispatcherConfig::default()).unwrap();
        let (changes, on_change) = recorder();
        let (updates, on_update) = recorder();
        let resource = ResourceId(7);
        dispatcher.add_listener(
            Scope::Value {
                resource,
                every_update: false,
            },
            on_change,
        );
        dispatcher.add_listener(
            Scope::Value {
                resource,
                every_update: true,
            },
            on_update,
        );
        let write = |changed| ResourceEvent::Value {
            resource,
            path: ResourcePath::top_level("r7").unwrap(),
            value: 1.0.into(),
            changed,
        };
        dispatcher.publish(write(true), &[resource]).unwrap();
        dispatcher.publish(write(false), &[resource]).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(changes.lock().len(), 1);
        assert_eq!(updates.lock().len(), 2);
    }

    struct CountingSink(Mutex<Vec<String>>);

    impl FaultSink for CountingSink {
        fn report(&self, _context: &str, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let dispatcher = Dispatcher::new(&DispatcherConfig::default()).unwrap();
        let sink = Arc::new(CountingSink(Mutex::new(Vec::new())));
        dispatcher.set_fault_sink(sink.clone());
        dispatcher.add_listener(
            Scope::AllStructure {
                kinds: EnumSet::all(),
            },
            Arc::new(|_: &ResourceEvent| panic!("listener bug")),
        );
        let (seen, listener) = recorder();
        dispatcher.add_listener(Scope::AllStructure { kinds: EnumSet::all() }, listener);
        dispatcher.publish(structure_event(1), &[]).unwrap();
        dispatcher.publish(structure_event(2), &[]).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(*sink.0.lock(), vec!["listener bug", "listener bug"]);
    }

    #[test]
    fn wait_idle_is_rejected_on_the_dispatch_thread() {
        let dispatcher = Arc::new(Dispatcher::new(&DispatcherConfig::default()).unwrap());
        let result = Arc::new(Mutex::new(None));
        let inner = dispatcher.clone();
        let slot = result.clone();
        dispatcher
            .submit("nested wait", move || {
                *slot.lock() = Some(inner.wait_idle(Duration::from_millis(10)));
            })
            .unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).unwrap());
        assert!(matches!(
            result.lock().take(),
            Some(Err(PatternError::Dispatch(_)))
        ));
    }
}
