//! Machine actors.
//!
//! A machine actor owns the authoritative state of one machine instance:
//! configuration, context, child registry and the latest snapshot. Events
//! are processed strictly one macrostep at a time. An event that arrives
//! while a step is running (from another thread, a child, or an action of
//! the running step) is queued in the mailbox and picked up by whoever is
//! currently processing, never interleaved.
//!
//! Processing a macrostep:
//! 1. Resolve against a clone of the committed state (no lock held)
//! 2. Commit the new state
//! 3. Execute effects microstep by microstep; `send_parent` events go out
//!    after their microstep, and only while this actor is still active
//! 4. Stop children whose owning state is no longer active
//! 5. Publish a snapshot if anything changed
//! 6. Start newly spawned children, replaying their mailboxes
//! 7. Report completion or failure to the parent

use crate::actor::{ActorCell, ActorRef, ActorStatus};
use crate::error::{ActorError, RuntimeError};
use crate::logic::{ActorLogic, MachineLogic, MachineOptions};
use crate::mailbox::Mailbox;
use crate::snapshot::Snapshot;
use crate::subscription::{SnapshotBroadcaster, SnapshotCallback, Subscription};
use crate::task::TaskActor;
use parking_lot::Mutex;
use rstate_core::{
    ActionArgs, Effect, Event, EventSender, MachineDefinition, MachineState, Macrostep, Resolver,
    StateId, Status,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

struct ChildEntry {
    actor: ActorRef,
    /// State whose exit stops the child.
    owner: StateId,
}

struct Inner {
    status: ActorStatus,
    state: MachineState,
    snapshot: Arc<Snapshot>,
    mailbox: Mailbox,
    children: BTreeMap<String, ChildEntry>,
    /// Initial macrostep, computed at creation and applied on start.
    pending_init: Option<Macrostep>,
}

pub(crate) struct MachineActor {
    id: String,
    session_id: String,
    logic: Arc<MachineLogic>,
    parent: Option<Weak<dyn ActorCell>>,
    this: Weak<MachineActor>,
    /// Held by whoever is running a macrostep.
    processing: AtomicBool,
    broadcaster: Arc<SnapshotBroadcaster>,
    inner: Mutex<Inner>,
}

impl MachineActor {
    pub(crate) fn spawn(
        id: String,
        logic: Arc<MachineLogic>,
        input: Option<Value>,
        parent: Option<Weak<dyn ActorCell>>,
    ) -> Arc<Self> {
        let context = logic.initial_context(input);
        let init = Resolver::with_config(&logic.definition, logic.engine.clone())
            .initial_state(Some(context));
        let snapshot = Arc::new(Snapshot::new(&logic.definition, &init.state, BTreeMap::new()));
        let broadcaster = Arc::new(SnapshotBroadcaster::new(logic.broadcast_capacity));

        Arc::new_cyclic(|this| Self {
            id,
            session_id: uuid::Uuid::new_v4().to_string(),
            parent,
            this: this.clone(),
            processing: AtomicBool::new(false),
            broadcaster,
            inner: Mutex::new(Inner {
                status: ActorStatus::NotStarted,
                state: init.state.clone(),
                snapshot,
                mailbox: Mailbox::new(),
                children: BTreeMap::new(),
                pending_init: Some(init),
            }),
            logic,
        })
    }

    fn definition(&self) -> &MachineDefinition {
        &self.logic.definition
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::with_config(&self.logic.definition, self.logic.engine.clone())
    }

    fn parent(&self) -> Option<Arc<dyn ActorCell>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn try_acquire(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.processing.store(false, Ordering::Release);
    }

    fn enqueue(&self, event: Event) {
        {
            let mut inner = self.inner.lock();
            match inner.status {
                ActorStatus::Stopped | ActorStatus::Errored => {
                    tracing::debug!(
                        actor = %self.id,
                        event = %event.event_type,
                        "Event sent to stopped actor ignored"
                    );
                    return;
                }
                ActorStatus::NotStarted => {
                    inner.mailbox.push(event);
                    return;
                }
                ActorStatus::Active => inner.mailbox.push(event),
            }
        }
        self.drain();
    }

    /// Processes queued events until the mailbox is empty. Returns at once
    /// if another caller is already processing; that caller picks up the
    /// queued event.
    fn drain(&self) {
        loop {
            if !self.try_acquire() {
                return;
            }

            loop {
                let next = {
                    let mut inner = self.inner.lock();
                    if inner.status != ActorStatus::Active {
                        None
                    } else {
                        match inner.mailbox.pop() {
                            Some(event) => Some((event, inner.state.clone())),
                            None => None,
                        }
                    }
                };
                let Some((event, state)) = next else {
                    break;
                };

                tracing::debug!(actor = %self.id, event = %event.event_type, "Processing event");
                let run = self.resolver().macrostep(&state, &event);
                self.apply(run);
            }

            self.release();

            // An event may have been queued between the last pop and release
            let pending = {
                let inner = self.inner.lock();
                inner.status == ActorStatus::Active && !inner.mailbox.is_empty()
            };
            if !pending {
                return;
            }
        }
    }

    fn apply(&self, run: Macrostep) {
        let Macrostep {
            state,
            microsteps,
            changed,
            error,
            ..
        } = run;

        {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::Active {
                tracing::debug!(actor = %self.id, "Discarding step of stopped actor");
                return;
            }
            inner.state = state.clone();
        }

        for effects in &microsteps {
            if ActorCell::status(self) != ActorStatus::Active {
                break;
            }
            let mut outbox = Vec::new();
            for effect in effects {
                if ActorCell::status(self) != ActorStatus::Active {
                    break;
                }
                if let Effect::SendParent(event) = effect {
                    outbox.push(event.clone());
                    continue;
                }
                if let Err(e) = self.execute(effect) {
                    tracing::warn!(
                        actor = %self.id,
                        action = effect.name(),
                        error = %e,
                        "Action failed, skipping rest of microstep"
                    );
                    break;
                }
            }
            self.flush_to_parent(outbox);
        }

        self.reconcile(&state);

        if changed {
            self.publish(&state);
        }

        self.start_children();

        match state.status {
            Status::Done => {
                tracing::info!(actor = %self.id, machine = %self.definition().id, "Machine done");
                if !self.finish(ActorStatus::Stopped) {
                    return;
                }
                if let Some(parent) = self.parent() {
                    let output = state.output.clone().unwrap_or(Value::Null);
                    parent.send(Event::done_invoke(&self.id, output));
                }
            }
            Status::Error => {
                let message = error
                    .map(|e| e.to_string())
                    .or_else(|| state.error.clone())
                    .unwrap_or_else(|| "machine failed".to_string());
                tracing::warn!(actor = %self.id, error = %message, "Machine failed");
                if !self.finish(ActorStatus::Errored) {
                    return;
                }
                if let Some(parent) = self.parent() {
                    let error = ActorError::new(&self.id, message);
                    parent.send(Event::error_platform(&self.id, error.to_value()));
                }
            }
            Status::Active => {}
        }
    }

    /// Delivers one microstep's `send_parent` events once its effects have
    /// run. Events are dropped as soon as this actor is no longer active,
    /// including when the parent's reaction to an earlier one stopped it.
    fn flush_to_parent(&self, outbox: Vec<Event>) {
        if outbox.is_empty() {
            return;
        }
        let Some(parent) = self.parent() else {
            tracing::debug!(actor = %self.id, dropped = outbox.len(), "No parent, events dropped");
            return;
        };
        for event in outbox {
            if ActorCell::status(self) != ActorStatus::Active {
                tracing::debug!(
                    actor = %self.id,
                    event = %event.event_type,
                    "Actor stopped, event to parent dropped"
                );
                break;
            }
            parent.send(event);
        }
    }

    fn execute(&self, effect: &Effect) -> Result<(), RuntimeError> {
        match effect {
            Effect::Custom {
                exec,
                context,
                event,
                ..
            } => {
                let args = ActionArgs {
                    context: context.as_ref(),
                    event,
                    actor: self,
                };
                exec(&args)?;
            }
            Effect::Spawn {
                id,
                src,
                input,
                owner,
            } => self.spawn_child(id, src, input.clone(), *owner),
            Effect::Stop { id } => self.stop_child(id),
            Effect::SendParent(event) => self.flush_to_parent(vec![event.clone()]),
            Effect::SendTo { to, event } => self.deliver_to(to, event.clone()),
            Effect::Log { message } => tracing::info!(actor = %self.id, "{}", message),
        }
        Ok(())
    }

    fn spawn_child(&self, id: &str, src: &str, input: Value, owner: StateId) {
        let Some(logic) = self.logic.actors.get(src).cloned() else {
            let error = RuntimeError::UnknownActor {
                src: src.to_string(),
            };
            tracing::warn!(actor = %self.id, child = %id, error = %error, "Cannot spawn child");
            let payload = ActorError::new(id, error.to_string()).to_value();
            self.enqueue(Event::error_platform(id, payload));
            return;
        };

        let parent: Weak<dyn ActorCell> = self.this.clone();
        let child = match logic {
            ActorLogic::Machine(machine) => ActorRef::new(MachineActor::spawn(
                id.to_string(),
                machine,
                Some(input),
                Some(parent),
            )),
            ActorLogic::Task(task) => {
                ActorRef::new(TaskActor::spawn(id.to_string(), task, input, Some(parent)))
            }
        };
        tracing::debug!(actor = %self.id, child = %id, src = %src, "Spawned child");

        let (accepted, previous) = {
            let mut inner = self.inner.lock();
            if inner.status == ActorStatus::Active {
                let entry = ChildEntry {
                    actor: child.clone(),
                    owner,
                };
                (true, inner.children.insert(id.to_string(), entry))
            } else {
                (false, None)
            }
        };
        if let Some(previous) = previous {
            previous.actor.stop();
        }
        if !accepted {
            child.stop();
        }
    }

    fn stop_child(&self, id: &str) {
        let removed = self.inner.lock().children.remove(id);
        if let Some(child) = removed {
            tracing::debug!(actor = %self.id, child = %id, "Stopping child");
            child.actor.stop();
        }
    }

    fn deliver_to(&self, child: &str, event: Event) {
        let target = self.inner.lock().children.get(child).map(|c| c.actor.clone());
        match target {
            Some(actor) => actor.send(event),
            None => tracing::debug!(
                actor = %self.id,
                child = %child,
                event = %event.event_type,
                "Unknown child, event dropped"
            ),
        }
    }

    /// Stops every child whose owning state is inactive, or all of them once
    /// the machine has finished.
    fn reconcile(&self, state: &MachineState) {
        let stale: Vec<(String, ActorRef)> = {
            let mut inner = self.inner.lock();
            let running = state.status == Status::Active;
            let ids: Vec<String> = inner
                .children
                .iter()
                .filter(|(_, c)| !running || !state.is_active(c.owner))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.children.remove(&id).map(|c| (id, c.actor)))
                .collect()
        };

        for (id, child) in stale {
            tracing::debug!(actor = %self.id, child = %id, "Stopping child of exited state");
            child.stop();
        }
    }

    fn publish(&self, state: &MachineState) {
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::Active {
                return;
            }
            let children = inner
                .children
                .iter()
                .map(|(id, c)| (id.clone(), c.actor.clone()))
                .collect();
            let snapshot = Arc::new(Snapshot::new(self.definition(), state, children));
            inner.snapshot = Arc::clone(&snapshot);
            snapshot
        };
        self.broadcaster.notify(&snapshot);
    }

    fn start_children(&self) {
        let children: Vec<ActorRef> = {
            let inner = self.inner.lock();
            if inner.status != ActorStatus::Active {
                return;
            }
            inner.children.values().map(|c| c.actor.clone()).collect()
        };
        for child in children {
            if child.status() == ActorStatus::NotStarted {
                child.start();
            }
        }
    }

    /// Ends processing after the machine reached a final or error status.
    /// Returns false if the actor had already been stopped.
    fn finish(&self, status: ActorStatus) -> bool {
        let children = {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::Active {
                return false;
            }
            inner.status = status;
            inner.mailbox.clear();
            std::mem::take(&mut inner.children)
        };
        for (_, child) in children {
            child.actor.stop();
        }
        self.broadcaster.clear();
        true
    }
}

impl ActorCell for MachineActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn status(&self) -> ActorStatus {
        self.inner.lock().status
    }

    fn send(&self, event: Event) {
        self.enqueue(event);
    }

    fn start(&self) {
        if !self.try_acquire() {
            return;
        }

        let pending = {
            let mut inner = self.inner.lock();
            if inner.status != ActorStatus::NotStarted {
                None
            } else {
                inner.status = ActorStatus::Active;
                Some(inner.pending_init.take())
            }
        };
        let Some(init) = pending else {
            self.release();
            return;
        };

        tracing::info!(
            actor = %self.id,
            machine = %self.definition().id,
            session_id = %self.session_id,
            "Actor started"
        );
        if let Some(run) = init {
            self.apply(run);
        }

        self.release();
        self.drain();
    }

    fn stop(&self) {
        let (children, processed) = {
            let mut inner = self.inner.lock();
            if inner.status.is_terminal() {
                return;
            }
            inner.status = ActorStatus::Stopped;
            inner.pending_init = None;
            inner.mailbox.clear();
            let processed = inner.mailbox.processed_count();
            (std::mem::take(&mut inner.children), processed)
        };

        for (_, child) in children {
            child.actor.stop();
        }

        {
            // Last engine state, without the stopped children
            let mut inner = self.inner.lock();
            let snapshot = Snapshot::new(self.definition(), &inner.state, BTreeMap::new());
            inner.snapshot = Arc::new(snapshot);
        }
        self.broadcaster.clear();

        tracing::info!(actor = %self.id, processed, "Actor stopped");
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        Some(Arc::clone(&self.inner.lock().snapshot))
    }

    fn subscribe(&self, callback: SnapshotCallback) -> Option<Subscription> {
        Some(self.broadcaster.subscribe(callback))
    }
}

impl EventSender for MachineActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, event: Event) {
        self.enqueue(event);
    }

    fn send_to(&self, child: &str, event: Event) {
        self.deliver_to(child, event);
    }
}

/// A statechart instance.
///
/// ```ignore
/// let machine = Machine::create(&definition, MachineOptions::new())?;
/// machine.subscribe(|snapshot| println!("{}", snapshot.to_json()));
/// machine.start();
/// machine.send("START");
/// ```
#[derive(Clone)]
pub struct Machine {
    actor: Arc<MachineActor>,
}

impl Machine {
    /// Builds a machine from a JSON definition. Unresolved names fail here.
    pub fn create(definition: &Value, options: MachineOptions) -> Result<Self, RuntimeError> {
        let logic = MachineLogic::new(definition, options)?;
        Ok(Self::from_logic(Arc::new(logic)))
    }

    /// Builds a machine from an already resolved definition. Actor sources
    /// without logic in `options` fail here.
    pub fn from_definition(
        definition: MachineDefinition,
        options: MachineOptions,
    ) -> Result<Self, RuntimeError> {
        let logic = MachineLogic::from_definition(definition, options)?;
        Ok(Self::from_logic(Arc::new(logic)))
    }

    pub fn from_logic(logic: Arc<MachineLogic>) -> Self {
        let id = logic.definition.id.clone();
        Self {
            actor: MachineActor::spawn(id, logic, None, None),
        }
    }

    pub fn id(&self) -> &str {
        &self.actor.id
    }

    pub fn session_id(&self) -> &str {
        &self.actor.session_id
    }

    pub fn definition(&self) -> &MachineDefinition {
        self.actor.definition()
    }

    /// Runs the initial entry actions, then replays buffered events.
    pub fn start(&self) {
        self.actor.start();
    }

    /// Stops the machine and, first, all of its children. Idempotent.
    pub fn stop(&self) {
        self.actor.stop();
    }

    pub fn send(&self, event: impl Into<Event>) {
        self.actor.enqueue(event.into());
    }

    /// Latest published snapshot.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.actor.inner.lock().snapshot)
    }

    /// Registers a callback run after each step that changed the state.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.actor.broadcaster.subscribe(Arc::new(callback))
    }

    pub fn subscribe_stream(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.actor.broadcaster.subscribe_stream()
    }

    /// Currently registered child.
    pub fn child(&self, id: &str) -> Option<ActorRef> {
        self.actor
            .inner
            .lock()
            .children
            .get(id)
            .map(|c| c.actor.clone())
    }

    pub fn status(&self) -> ActorStatus {
        ActorCell::status(self.actor.as_ref())
    }

    pub fn actor_ref(&self) -> ActorRef {
        ActorRef::new(self.actor.clone())
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.actor.id)
            .field("session_id", &self.actor.session_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstate_core::{ActionError, EngineConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<parking_lot::Mutex<Vec<String>>>;

    fn toggle() -> Value {
        json!({
            "id": "toggle",
            "initial": "idle",
            "states": {
                "idle": {"on": {"START": "running"}},
                "running": {"on": {"STOP": "idle"}}
            }
        })
    }

    fn counter(machine: &Machine) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        machine.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn recorder(log: &Log) -> ActorLogic {
        let log = Arc::clone(log);
        let def = json!({
            "id": "recorder",
            "initial": "listening",
            "states": {"listening": {"on": {"*": {"actions": "record"}}}}
        });
        let options = MachineOptions::new().with_action("record", move |args| {
            log.lock().push(args.event.event_type.clone());
            Ok(())
        });
        ActorLogic::machine(MachineLogic::new(&def, options).unwrap())
    }

    #[test]
    fn test_toggle_notifications() {
        let machine = Machine::create(&toggle(), MachineOptions::new()).unwrap();
        machine.start();
        assert_eq!(machine.status(), ActorStatus::Active);
        let count = counter(&machine);

        // No matching transition: no notification, same snapshot
        let before = machine.get_snapshot();
        machine.send("STOP");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&before, &machine.get_snapshot()));

        machine.send("START");
        assert!(machine.get_snapshot().matches("running"));
        machine.send("STOP");
        assert!(machine.get_snapshot().matches("idle"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_initial_entry_runs_once_before_buffered_events() {
        let log: Log = Arc::default();
        let l = Arc::clone(&log);
        let def = json!({
            "initial": "a",
            "states": {
                "a": {"entry": "record", "on": {"GO": "b"}},
                "b": {"entry": "record"}
            }
        });
        let options = MachineOptions::new().with_action("record", move |args| {
            l.lock().push(args.event.event_type.clone());
            Ok(())
        });
        let machine = Machine::create(&def, options).unwrap();
        let count = counter(&machine);

        machine.send("GO");
        assert!(log.lock().is_empty());
        assert!(machine.get_snapshot().matches("a"));
        assert_eq!(machine.status(), ActorStatus::NotStarted);

        machine.start();
        assert_eq!(*log.lock(), vec!["xstate.init".to_string(), "GO".to_string()]);
        assert!(machine.get_snapshot().matches("b"));
        // Initial snapshot plus GO
        assert_eq!(count.load(Ordering::SeqCst), 2);

        machine.start();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_child_mailbox_replayed_in_order() {
        let log: Log = Arc::default();
        let def = json!({
            "id": "parent",
            "initial": "idle",
            "states": {
                "idle": {"on": {"OPEN": "s"}},
                "s": {
                    "entry": [
                        {"type": "spawn", "id": "rec", "src": "recorder"},
                        {"type": "send_to", "to": "rec", "event": "A"},
                        {"type": "send_to", "to": "rec", "event": "B"}
                    ]
                }
            }
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("recorder", recorder(&log)))
                .unwrap();
        machine.start();
        machine.send("OPEN");

        assert_eq!(*log.lock(), vec!["A".to_string(), "B".to_string()]);
        let child = machine.child("rec").unwrap();
        assert_eq!(child.status(), ActorStatus::Active);
        assert!(machine.get_snapshot().children.contains_key("rec"));
    }

    #[test]
    fn test_exit_stops_child_and_stale_ref_is_noop() {
        let log: Log = Arc::default();
        let def = json!({
            "id": "parent",
            "initial": "idle",
            "states": {
                "idle": {"on": {"OPEN": "s"}},
                "s": {"invoke": {"id": "job", "src": "recorder"}, "on": {"LEAVE": "idle"}}
            }
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("recorder", recorder(&log)))
                .unwrap();
        machine.start();
        machine.send("OPEN");

        let child = machine.child("job").unwrap();
        child.send("X");
        assert_eq!(*log.lock(), vec!["X".to_string()]);
        assert_eq!(
            machine.get_snapshot().to_json()["children"]["job"]["id"],
            json!("job")
        );

        machine.send("LEAVE");
        assert_eq!(child.status(), ActorStatus::Stopped);
        assert!(machine.child("job").is_none());
        assert!(machine.get_snapshot().children.is_empty());

        child.send("Y");
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_recursive() {
        let log: Log = Arc::default();
        let def = json!({
            "initial": "s",
            "states": {"s": {"invoke": {"id": "job", "src": "recorder"}, "on": {"GO": "t"}}, "t": {}}
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("recorder", recorder(&log)))
                .unwrap();
        let count = counter(&machine);
        machine.start();
        let child = machine.child("job").unwrap();

        machine.stop();
        let first = machine.get_snapshot();
        assert_eq!(machine.status(), ActorStatus::Stopped);
        assert_eq!(child.status(), ActorStatus::Stopped);
        assert_eq!(first.status, Status::Active);
        assert!(first.children.is_empty());

        machine.stop();
        assert!(Arc::ptr_eq(&first, &machine.get_snapshot()));

        machine.send("GO");
        assert!(machine.get_snapshot().matches("s"));
        // Only the initial snapshot was published
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_before_start() {
        let machine = Machine::create(&toggle(), MachineOptions::new()).unwrap();
        machine.send("START");
        machine.stop();
        machine.start();
        assert_eq!(machine.status(), ActorStatus::Stopped);
        assert!(machine.get_snapshot().matches("idle"));
    }

    #[test]
    fn test_divergence_surfaces_error_status() {
        let def = json!({
            "initial": "idle",
            "states": {
                "idle": {"on": {"GO": "ping"}},
                "ping": {"always": "pong"},
                "pong": {"always": "ping"}
            }
        });
        let options = MachineOptions::new()
            .with_engine_config(EngineConfig::default().with_max_microsteps(20));
        let machine = Machine::create(&def, options).unwrap();
        machine.start();
        let count = counter(&machine);

        machine.send("GO");
        let snapshot = machine.get_snapshot();
        assert_eq!(snapshot.status, Status::Error);
        assert!(snapshot.error.is_some());
        assert_eq!(machine.status(), ActorStatus::Errored);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        machine.send("GO");
        assert!(Arc::ptr_eq(&snapshot, &machine.get_snapshot()));
    }

    #[test]
    fn test_action_error_commits_state() {
        let after = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&after);
        let def = json!({
            "initial": "a",
            "states": {
                "a": {"on": {"GO": {"target": "b", "actions": ["fail", "after"]}}},
                "b": {}
            }
        });
        let options = MachineOptions::new()
            .with_action("fail", |_| Err(ActionError::new("fail", "boom")))
            .with_action("after", move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let machine = Machine::create(&def, options).unwrap();
        machine.start();
        machine.send("GO");

        assert!(machine.get_snapshot().matches("b"));
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(machine.status(), ActorStatus::Active);
    }

    #[test]
    fn test_action_error_still_stops_children_of_exited_state() {
        let log: Log = Arc::default();
        let def = json!({
            "initial": "s",
            "states": {
                "s": {"exit": "fail", "invoke": {"id": "job", "src": "recorder"}, "on": {"GO": "t"}},
                "t": {}
            }
        });
        let options = MachineOptions::new()
            .with_actor("recorder", recorder(&log))
            .with_action("fail", |_| Err(ActionError::new("fail", "boom")));
        let machine = Machine::create(&def, options).unwrap();
        machine.start();
        let child = machine.child("job").unwrap();

        machine.send("GO");
        assert!(machine.get_snapshot().matches("t"));
        assert_eq!(child.status(), ActorStatus::Stopped);
    }

    #[test]
    fn test_child_done_notifies_parent() {
        let worker = json!({
            "id": "worker",
            "initial": "working",
            "states": {
                "working": {"on": {"FINISH": "finished"}},
                "finished": {"type": "final", "output": {"result": 42}}
            }
        });
        let worker =
            ActorLogic::machine(MachineLogic::new(&worker, MachineOptions::new()).unwrap());
        let def = json!({
            "id": "parent",
            "initial": "loading",
            "states": {
                "loading": {
                    "invoke": {"id": "w", "src": "worker"},
                    "on": {"done.invoke.w": {"target": "ready", "actions": {"type": "assign", "merge_event": true}}}
                },
                "ready": {}
            }
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("worker", worker)).unwrap();
        machine.start();

        let child = machine.child("w").unwrap();
        child.send("FINISH");

        let snapshot = machine.get_snapshot();
        assert!(snapshot.matches("ready"));
        assert_eq!(snapshot.context["result"], 42);
        assert_eq!(child.status(), ActorStatus::Stopped);
        assert_eq!(child.get_snapshot().unwrap().status, Status::Done);
    }

    #[test]
    fn test_child_send_parent_during_start() {
        let pinger = json!({
            "id": "pinger",
            "initial": "on",
            "states": {"on": {"entry": {"type": "send_parent", "event": "READY"}}}
        });
        let pinger =
            ActorLogic::machine(MachineLogic::new(&pinger, MachineOptions::new()).unwrap());
        let def = json!({
            "initial": "waiting",
            "states": {
                "waiting": {"invoke": {"id": "p", "src": "pinger"}, "on": {"READY": "ready"}},
                "ready": {}
            }
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("pinger", pinger)).unwrap();
        machine.start();
        assert!(machine.get_snapshot().matches("ready"));
    }

    #[test]
    fn test_child_events_dropped_once_parent_stops_it() {
        let kid = json!({
            "id": "kid",
            "initial": "idle",
            "states": {
                "idle": {
                    "on": {
                        "GO": {"actions": [
                            {"type": "send_parent", "event": "E1"},
                            {"type": "send_parent", "event": "E2"}
                        ]}
                    }
                }
            }
        });
        let kid = ActorLogic::machine(MachineLogic::new(&kid, MachineOptions::new()).unwrap());
        let def = json!({
            "initial": "s",
            "states": {
                "s": {"invoke": {"id": "kid", "src": "kid"}, "on": {"E1": "t"}},
                "t": {"on": {"E2": "u"}},
                "u": {}
            }
        });
        let machine = Machine::create(&def, MachineOptions::new().with_actor("kid", kid)).unwrap();
        machine.start();

        let child = machine.child("kid").unwrap();
        child.send("GO");

        assert_eq!(child.status(), ActorStatus::Stopped);
        assert!(machine.get_snapshot().matches("t"));
    }

    #[test]
    fn test_stopped_child_does_not_report_done() {
        let kid = json!({
            "id": "kid",
            "initial": "idle",
            "states": {
                "idle": {
                    "on": {"GO": {"target": "end", "actions": {"type": "send_parent", "event": "LEAVE"}}}
                },
                "end": {"type": "final"}
            }
        });
        let kid = ActorLogic::machine(MachineLogic::new(&kid, MachineOptions::new()).unwrap());
        let def = json!({
            "initial": "s",
            "on": {"done.invoke.kid": "leaked"},
            "states": {
                "s": {"invoke": {"id": "kid", "src": "kid"}, "on": {"LEAVE": "t"}},
                "t": {},
                "leaked": {}
            }
        });
        let machine = Machine::create(&def, MachineOptions::new().with_actor("kid", kid)).unwrap();
        machine.start();

        let child = machine.child("kid").unwrap();
        child.send("GO");

        assert_eq!(child.status(), ActorStatus::Stopped);
        assert!(machine.get_snapshot().matches("t"));
    }

    #[test]
    fn test_root_spawn_buffers_early_events_and_outlives_states() {
        let log: Log = Arc::default();
        let def = json!({
            "initial": "idle",
            "entry": [
                {"type": "spawn", "id": "r", "src": "recorder", "assign_ref": "ref"},
                {"type": "send_to", "to": "r", "event": "EARLY"}
            ],
            "states": {
                "idle": {"on": {"GO": "s"}},
                "s": {"on": {"LEAVE": "idle"}}
            }
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("recorder", recorder(&log)))
                .unwrap();
        machine.start();

        assert_eq!(*log.lock(), vec!["EARLY".to_string()]);
        assert_eq!(machine.get_snapshot().context["ref"], "r");

        machine.send("GO");
        machine.send("LEAVE");
        let child = machine.child("r").unwrap();
        assert_eq!(child.status(), ActorStatus::Active);
        assert!(machine.get_snapshot().children.contains_key("r"));
    }

    #[test]
    fn test_entry_spawn_stopped_on_exit() {
        let log: Log = Arc::default();
        let def = json!({
            "initial": "idle",
            "states": {
                "idle": {"on": {"GO": "s"}},
                "s": {
                    "entry": {"type": "spawn", "id": "helper", "src": "recorder"},
                    "on": {"LEAVE": "idle"}
                }
            }
        });
        let machine =
            Machine::create(&def, MachineOptions::new().with_actor("recorder", recorder(&log)))
                .unwrap();
        machine.start();
        machine.send("GO");

        let child = machine.child("helper").unwrap();
        assert_eq!(child.status(), ActorStatus::Active);

        machine.send("LEAVE");
        assert_eq!(child.status(), ActorStatus::Stopped);
        assert!(machine.child("helper").is_none());
        child.send("LATE");
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_from_definition_rejects_missing_actor() {
        let def = json!({
            "initial": "a",
            "states": {"a": {"invoke": {"id": "w", "src": "worker"}}}
        });
        let impls = rstate_core::Implementations::new().with_actor("worker");
        let definition = MachineDefinition::from_json(&def, &impls).unwrap();

        let err = Machine::from_definition(definition, MachineOptions::new()).unwrap_err();
        assert_eq!(err.error_code(), "UNRESOLVED_IMPLEMENTATION");
    }

    #[test]
    fn test_child_error_delivered_as_event() {
        let broken = json!({
            "id": "broken",
            "initial": "ping",
            "states": {"ping": {"always": "pong"}, "pong": {"always": "ping"}}
        });
        let broken = MachineLogic::new(
            &broken,
            MachineOptions::new()
                .with_engine_config(EngineConfig::default().with_max_microsteps(10)),
        )
        .unwrap();
        let def = json!({
            "initial": "running",
            "states": {
                "running": {
                    "invoke": {"id": "c", "src": "broken"},
                    "on": {"error.platform.c": {"target": "failed", "actions": {"type": "assign", "merge_event": true}}}
                },
                "failed": {}
            }
        });
        let machine = Machine::create(
            &def,
            MachineOptions::new().with_actor("broken", ActorLogic::machine(broken)),
        )
        .unwrap();
        machine.start();

        let snapshot = machine.get_snapshot();
        assert!(snapshot.matches("failed"));
        assert_eq!(snapshot.context["actor_id"], "c");
        assert_eq!(machine.status(), ActorStatus::Active);
    }

    #[test]
    fn test_action_sends_to_self() {
        let def = json!({
            "initial": "a",
            "states": {"a": {"entry": "kick", "on": {"NEXT": "b"}}, "b": {}}
        });
        let options = MachineOptions::new().with_action("kick", |args| {
            args.actor.send(Event::new("NEXT"));
            Ok(())
        });
        let machine = Machine::create(&def, options).unwrap();
        machine.start();
        assert!(machine.get_snapshot().matches("b"));
    }

    #[test]
    fn test_top_level_done() {
        let def = json!({
            "initial": "a",
            "states": {"a": {"on": {"END": "end"}}, "end": {"type": "final", "output": {"ok": true}}}
        });
        let machine = Machine::create(&def, MachineOptions::new()).unwrap();
        machine.start();
        machine.send("END");

        let snapshot = machine.get_snapshot();
        assert!(snapshot.is_done());
        assert_eq!(snapshot.output, Some(json!({"ok": true})));
        assert_eq!(machine.status(), ActorStatus::Stopped);
    }

    #[test]
    fn test_subscribe_stream_and_unsubscribe() {
        let machine = Machine::create(&toggle(), MachineOptions::new()).unwrap();
        let mut rx = machine.subscribe_stream();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = machine.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        machine.start();
        assert!(rx.try_recv().unwrap().matches("idle"));

        sub.unsubscribe();
        machine.send("START");
        assert!(rx.try_recv().unwrap().matches("running"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_actor_ref_serializes_as_ids() {
        let machine = Machine::create(&toggle(), MachineOptions::new()).unwrap();
        let actor = machine.actor_ref();
        assert_eq!(actor.id(), "toggle");
        assert_eq!(
            serde_json::to_value(&actor).unwrap(),
            json!({"id": "toggle", "session_id": machine.session_id()})
        );
    }
}
