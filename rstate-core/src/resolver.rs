//! Configuration resolver.
//!
//! Computes, for a machine state and an event, the enabled transitions and
//! the microstep that takes them. Resolution is pure: the result carries the
//! next state plus the effects for the runtime to execute, and nothing else
//! is touched.
//!
//! Selection walks from every active atomic node up through its ancestors
//! and takes the first transition whose descriptor matches and whose guard
//! passes, so descendants shadow their ancestors. When two selected
//! transitions would exit a common node, the one declared on an ancestor
//! wins; otherwise the earlier one in document order wins.

use crate::action::{Action, Assignment, Effect};
use crate::config::EngineConfig;
use crate::definition::{
    HistoryKind, MachineDefinition, StateId, StateKind, StateNode, TransitionDef,
};
use crate::event::Event;
use crate::state::{HistoryMap, MachineState, Status};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::iter;
use std::sync::Arc;

/// Result of one microstep.
#[derive(Debug, Clone)]
pub struct Microstep {
    /// Exited nodes, descendants before ancestors.
    pub exit_set: Vec<StateId>,
    /// Entered nodes, ancestors before descendants.
    pub entry_set: Vec<StateId>,
    /// Effects in execution order.
    pub effects: Vec<Effect>,
    /// Events raised for the internal queue.
    pub raised: Vec<Event>,
    pub state: MachineState,
    /// Whether configuration, context or status changed.
    pub changed: bool,
}

/// Resolves transitions against a definition.
#[derive(Debug, Clone)]
pub struct Resolver<'a> {
    pub(crate) def: &'a MachineDefinition,
    pub(crate) config: EngineConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(def: &'a MachineDefinition) -> Self {
        Self::with_config(def, EngineConfig::default())
    }

    pub fn with_config(def: &'a MachineDefinition, config: EngineConfig) -> Self {
        Self { def, config }
    }

    pub fn definition(&self) -> &'a MachineDefinition {
        self.def
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transitions enabled by `event`, conflicts removed.
    pub fn select_transitions(
        &self,
        state: &MachineState,
        event: &Event,
    ) -> Vec<&'a TransitionDef> {
        self.select(state, event, |node| node.candidates(&event.event_type))
    }

    /// Eventless transitions enabled in `state`. Guards see the last event.
    pub fn select_eventless_transitions(&self, state: &MachineState) -> Vec<&'a TransitionDef> {
        self.select(state, &state.event, |node| node.always.iter().collect())
    }

    fn select<F>(
        &self,
        state: &MachineState,
        event: &Event,
        candidates: F,
    ) -> Vec<&'a TransitionDef>
    where
        F: Fn(&'a StateNode) -> Vec<&'a TransitionDef>,
    {
        let mut enabled: Vec<&'a TransitionDef> = Vec::new();

        for atomic in state.atomic_states(self.def) {
            let chain = iter::once(atomic).chain(self.def.proper_ancestors(atomic, None));
            'walk: for id in chain {
                for transition in candidates(self.def.node(id)) {
                    if self.guard_passes(transition, &state.context, event) {
                        if !enabled.iter().any(|t| t.order == transition.order) {
                            enabled.push(transition);
                        }
                        break 'walk;
                    }
                }
            }
        }

        self.remove_conflicts(state, enabled)
    }

    fn guard_passes(&self, transition: &TransitionDef, ctx: &Value, event: &Event) -> bool {
        let Some(guard) = &transition.guard else {
            return true;
        };
        match guard.check(ctx, event) {
            Ok(passed) => passed,
            Err(e) => {
                if self.config.log_guard_errors {
                    tracing::warn!(
                        guard = %guard.describe(),
                        event = %event.event_type,
                        source = %self.def.node(transition.source).id,
                        error = %e,
                        "Guard failed, treating as false"
                    );
                }
                false
            }
        }
    }

    fn remove_conflicts(
        &self,
        state: &MachineState,
        enabled: Vec<&'a TransitionDef>,
    ) -> Vec<&'a TransitionDef> {
        let mut filtered: Vec<(&'a TransitionDef, BTreeSet<StateId>)> = Vec::new();

        for t1 in enabled {
            let exit1 = self.exit_set_of(&state.configuration, &state.history, t1);
            let mut preempted = false;
            let mut to_remove = Vec::new();

            for (i, (t2, exit2)) in filtered.iter().enumerate() {
                if exit1.is_disjoint(exit2) {
                    continue;
                }
                if self.def.is_descendant(t2.source, t1.source) {
                    to_remove.push(i);
                } else {
                    preempted = true;
                    break;
                }
            }

            if !preempted {
                for i in to_remove.into_iter().rev() {
                    filtered.remove(i);
                }
                filtered.push((t1, exit1));
            }
        }

        filtered.into_iter().map(|(t, _)| t).collect()
    }

    /// Takes the given transitions.
    pub fn microstep(
        &self,
        state: &MachineState,
        event: &Event,
        transitions: &[&TransitionDef],
    ) -> Microstep {
        self.step(state, event, transitions, false)
    }

    /// Takes the given transitions; with `enter_root`, also enters the root
    /// and its default descendants (the initial step).
    pub(crate) fn step(
        &self,
        state: &MachineState,
        event: &Event,
        transitions: &[&TransitionDef],
        enter_root: bool,
    ) -> Microstep {
        let mut ctx = Arc::clone(&state.context);
        let mut configuration = state.configuration.clone();
        let mut history = Arc::clone(&state.history);
        let mut effects = Vec::new();
        let mut raised = Vec::new();

        // Exit
        let mut exiting = BTreeSet::new();
        for t in transitions {
            exiting.extend(self.exit_set_of(&state.configuration, &state.history, t));
        }
        let exit_set: Vec<StateId> = exiting.iter().rev().copied().collect();

        for &s in &exit_set {
            for &h in self.def.children(s) {
                let history_node = self.def.node(h);
                if !history_node.is_history() {
                    continue;
                }
                let recorded: Vec<StateId> = match history_node.history {
                    HistoryKind::Deep => state
                        .configuration
                        .iter()
                        .copied()
                        .filter(|x| self.def.node(*x).is_atomic() && self.def.is_descendant(*x, s))
                        .collect(),
                    HistoryKind::Shallow => state
                        .configuration
                        .iter()
                        .copied()
                        .filter(|x| self.def.parent(*x) == Some(s))
                        .collect(),
                };
                Arc::make_mut(&mut history).insert(h, recorded);
            }
        }

        for &s in &exit_set {
            let node = self.def.node(s);
            self.apply_actions(&node.exit, s, event, &mut ctx, &mut effects, &mut raised);
            for invoke in &node.invoke {
                effects.push(Effect::Stop {
                    id: invoke.id.clone(),
                });
            }
            configuration.remove(&s);
        }

        // Transition actions
        for t in transitions {
            let owner = self.transition_domain(t, &history).unwrap_or(t.source);
            self.apply_actions(&t.actions, owner, event, &mut ctx, &mut effects, &mut raised);
        }

        // Entry
        let mut entering = BTreeSet::new();
        if enter_root {
            self.add_descendants(StateId::ROOT, &history, &mut entering);
        }
        for t in transitions {
            if t.is_targetless() {
                continue;
            }
            let domain = self.transition_domain(t, &history);
            for &target in &t.targets {
                self.add_descendants(target, &history, &mut entering);
            }
            for target in self.effective_targets(t, &history) {
                self.add_ancestors(target, domain, &history, &mut entering);
            }
        }
        let entry_set: Vec<StateId> = entering
            .into_iter()
            .filter(|s| !configuration.contains(s))
            .collect();

        for &s in &entry_set {
            configuration.insert(s);
            let node = self.def.node(s);
            self.apply_actions(&node.entry, s, event, &mut ctx, &mut effects, &mut raised);
            for invoke in &node.invoke {
                effects.push(Effect::Spawn {
                    id: invoke.id.clone(),
                    src: invoke.src.clone(),
                    input: invoke.input.clone(),
                    owner: s,
                });
            }

            if !node.is_final() {
                continue;
            }
            let Some(parent) = node.parent.filter(|p| *p != StateId::ROOT) else {
                continue;
            };
            let parent_node = self.def.node(parent);
            push_unique(
                &mut raised,
                Event::done_state(&parent_node.id, node.output.clone().unwrap_or(Value::Null)),
            );
            // Completion climbs through nested parallel nodes
            let mut ancestor = parent_node.parent;
            while let Some(id) = ancestor {
                let ancestor_node = self.def.node(id);
                if ancestor_node.kind != StateKind::Parallel
                    || !self.is_in_final_state(&configuration, id)
                {
                    break;
                }
                push_unique(
                    &mut raised,
                    Event::done_state(
                        &ancestor_node.id,
                        ancestor_node.output.clone().unwrap_or(Value::Null),
                    ),
                );
                ancestor = ancestor_node.parent;
            }
        }

        let mut status = state.status;
        let mut output = state.output.clone();
        if status == Status::Active && self.is_in_final_state(&configuration, StateId::ROOT) {
            status = Status::Done;
            output = Some(self.machine_output(&configuration));
            tracing::debug!(machine = %self.def.id, "Machine reached final state");
        }

        let changed = enter_root
            || transitions.iter().any(|t| !t.is_targetless())
            || !Arc::ptr_eq(&ctx, &state.context)
            || status != state.status;

        tracing::debug!(
            machine = %self.def.id,
            event = %event.event_type,
            transitions = transitions.len(),
            exited = exit_set.len(),
            entered = entry_set.len(),
            effects = effects.len(),
            raised = raised.len(),
            "Microstep"
        );

        Microstep {
            exit_set,
            entry_set,
            effects,
            raised,
            state: MachineState {
                configuration,
                context: ctx,
                history,
                status,
                output,
                error: state.error.clone(),
                event: event.clone(),
            },
            changed,
        }
    }

    fn apply_actions(
        &self,
        actions: &[Action],
        owner: StateId,
        event: &Event,
        ctx: &mut Arc<Value>,
        effects: &mut Vec<Effect>,
        raised: &mut Vec<Event>,
    ) {
        for action in actions {
            match action {
                Action::Assign(assignment) => {
                    let next = assignment.apply(ctx, event);
                    *ctx = Arc::new(next);
                }
                Action::Raise(e) => raised.push(e.clone()),
                Action::SendParent(e) => effects.push(Effect::SendParent(e.clone())),
                Action::SendTo { to, event: e } => effects.push(Effect::SendTo {
                    to: to.clone(),
                    event: e.clone(),
                }),
                Action::Spawn(spawn) => {
                    effects.push(Effect::Spawn {
                        id: spawn.id.clone(),
                        src: spawn.src.clone(),
                        input: spawn.input.clone(),
                        owner,
                    });
                    if let Some(field) = &spawn.assign_ref {
                        let mut fields = Map::new();
                        fields.insert(field.clone(), Value::String(spawn.id.clone()));
                        let next = Assignment::Set(fields).apply(ctx, event);
                        *ctx = Arc::new(next);
                    }
                }
                Action::Stop { id } => effects.push(Effect::Stop { id: id.clone() }),
                Action::Log(message) => effects.push(Effect::Log {
                    message: message.clone(),
                }),
                Action::Custom { name, exec } => effects.push(Effect::Custom {
                    name: name.clone(),
                    exec: Arc::clone(exec),
                    context: Arc::clone(ctx),
                    event: event.clone(),
                }),
            }
        }
    }

    /// Nodes a transition exits from the given configuration.
    fn exit_set_of(
        &self,
        configuration: &BTreeSet<StateId>,
        history: &HistoryMap,
        transition: &TransitionDef,
    ) -> BTreeSet<StateId> {
        match self.transition_domain(transition, history) {
            Some(domain) => configuration
                .iter()
                .copied()
                .filter(|s| self.def.is_descendant(*s, domain))
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// The node whose active descendants a transition exits and re-enters.
    /// `None` for targetless transitions.
    pub fn transition_domain(
        &self,
        transition: &TransitionDef,
        history: &HistoryMap,
    ) -> Option<StateId> {
        let targets = self.effective_targets(transition, history);
        if targets.is_empty() {
            return None;
        }

        let source = self.def.node(transition.source);
        if !transition.reenter
            && !source.is_atomic()
            && targets
                .iter()
                .all(|s| self.def.is_descendant(*s, transition.source))
        {
            return Some(transition.source);
        }

        let mut states = Vec::with_capacity(targets.len() + 1);
        states.push(transition.source);
        states.extend(targets);
        Some(self.find_lcca(&states))
    }

    /// Least common compound ancestor; the root counts as compound.
    fn find_lcca(&self, states: &[StateId]) -> StateId {
        let Some((head, tail)) = states.split_first() else {
            return StateId::ROOT;
        };
        self.def
            .proper_ancestors(*head, None)
            .into_iter()
            .find(|anc| {
                (self.def.node(*anc).kind == StateKind::Compound || *anc == StateId::ROOT)
                    && tail.iter().all(|s| self.def.is_descendant(*s, *anc))
            })
            .unwrap_or(StateId::ROOT)
    }

    /// Targets with history nodes replaced by what they stand for.
    fn effective_targets(&self, transition: &TransitionDef, history: &HistoryMap) -> Vec<StateId> {
        let mut targets = Vec::new();
        for &target in &transition.targets {
            self.collect_effective(target, history, &mut targets);
        }
        targets
    }

    fn collect_effective(&self, id: StateId, history: &HistoryMap, out: &mut Vec<StateId>) {
        if !self.def.node(id).is_history() {
            if !out.contains(&id) {
                out.push(id);
            }
            return;
        }
        match history.get(&id) {
            Some(recorded) => {
                for r in recorded {
                    if !out.contains(r) {
                        out.push(*r);
                    }
                }
            }
            None => {
                for d in self.history_defaults(id) {
                    self.collect_effective(d, history, out);
                }
            }
        }
    }

    /// Where a history node leads before anything was recorded: its own
    /// `target`, else its parent's initial child, else every region of a
    /// parallel parent.
    fn history_defaults(&self, id: StateId) -> Vec<StateId> {
        let node = self.def.node(id);
        if !node.history_target.is_empty() {
            return node.history_target.clone();
        }
        let parent = self.def.node(node.parent.unwrap_or(StateId::ROOT));
        let real_children = parent
            .children
            .iter()
            .copied()
            .filter(|c| !self.def.node(*c).is_history());
        match parent.kind {
            StateKind::Parallel => real_children.collect(),
            _ => match parent.initial {
                Some(initial) if initial != id => vec![initial],
                _ => real_children.take(1).collect(),
            },
        }
    }

    fn add_descendants(&self, id: StateId, history: &HistoryMap, entering: &mut BTreeSet<StateId>) {
        let node = self.def.node(id);
        if node.is_history() {
            let restored = match history.get(&id) {
                Some(recorded) => recorded.clone(),
                None => self.history_defaults(id),
            };
            for &s in &restored {
                self.add_descendants(s, history, entering);
            }
            for &s in &restored {
                self.add_ancestors(s, node.parent, history, entering);
            }
            return;
        }

        entering.insert(id);
        match node.kind {
            StateKind::Compound => {
                if let Some(initial) = node.initial {
                    self.add_descendants(initial, history, entering);
                    self.add_ancestors(initial, Some(id), history, entering);
                }
            }
            StateKind::Parallel => {
                for &child in &node.children {
                    if self.def.node(child).is_history() {
                        continue;
                    }
                    if !entering.iter().any(|s| self.def.is_descendant(*s, child)) {
                        self.add_descendants(child, history, entering);
                    }
                }
            }
            _ => {}
        }
    }

    fn add_ancestors(
        &self,
        id: StateId,
        upto: Option<StateId>,
        history: &HistoryMap,
        entering: &mut BTreeSet<StateId>,
    ) {
        for anc in self.def.proper_ancestors(id, upto) {
            entering.insert(anc);
            let node = self.def.node(anc);
            if node.kind != StateKind::Parallel {
                continue;
            }
            for &child in &node.children {
                if self.def.node(child).is_history() {
                    continue;
                }
                if !entering.iter().any(|s| self.def.is_descendant(*s, child)) {
                    self.add_descendants(child, history, entering);
                }
            }
        }
    }

    /// A compound is final when an active child is final; a parallel node
    /// when every region is.
    pub fn is_in_final_state(&self, configuration: &BTreeSet<StateId>, id: StateId) -> bool {
        let node = self.def.node(id);
        match node.kind {
            StateKind::Compound => node
                .children
                .iter()
                .any(|c| configuration.contains(c) && self.def.node(*c).is_final()),
            StateKind::Parallel => node
                .children
                .iter()
                .filter(|c| !self.def.node(**c).is_history())
                .all(|c| self.is_in_final_state(configuration, *c)),
            _ => false,
        }
    }

    fn machine_output(&self, configuration: &BTreeSet<StateId>) -> Value {
        let root = self.def.root();
        if let Some(output) = &root.output {
            return output.clone();
        }
        root.children
            .iter()
            .find(|c| configuration.contains(c) && self.def.node(**c).is_final())
            .and_then(|c| self.def.node(*c).output.clone())
            .unwrap_or(Value::Null)
    }
}

fn push_unique(events: &mut Vec<Event>, event: Event) {
    if !events.iter().any(|e| e.event_type == event.event_type) {
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ActionError, GuardError};
    use crate::implementations::Implementations;
    use serde_json::json;
    use std::sync::Mutex;

    fn def(json: Value) -> MachineDefinition {
        MachineDefinition::from_json(&json, &Implementations::new()).unwrap()
    }

    fn def_with(json: Value, impls: &Implementations) -> MachineDefinition {
        MachineDefinition::from_json(&json, impls).unwrap()
    }

    fn ids(def: &MachineDefinition, list: &[StateId]) -> Vec<String> {
        list.iter().map(|s| def.node(*s).path.clone()).collect()
    }

    fn initial(resolver: &Resolver<'_>) -> MachineState {
        let start = MachineState::pre_initial(resolver.definition().initial_context());
        resolver.step(&start, &Event::init(), &[], true).state
    }

    fn send(resolver: &Resolver<'_>, state: &MachineState, event: &str) -> Microstep {
        let event = Event::new(event);
        let enabled = resolver.select_transitions(state, &event);
        resolver.microstep(state, &event, &enabled)
    }

    #[test]
    fn test_initial_entry_order() {
        let d = def(json!({
            "id": "m",
            "initial": "a",
            "states": {
                "a": {"initial": "a1", "states": {"a1": {}, "a2": {}}},
                "b": {}
            }
        }));
        let resolver = Resolver::new(&d);
        let start = MachineState::pre_initial(json!({}));
        let step = resolver.step(&start, &Event::init(), &[], true);
        assert_eq!(ids(&d, &step.entry_set), vec!["m", "m.a", "m.a.a1"]);
        assert!(step.exit_set.is_empty());
        assert!(step.changed);
        assert!(step.state.is_consistent(&d));
    }

    #[test]
    fn test_descendant_shadows_ancestor() {
        let d = def(json!({
            "initial": "parent",
            "states": {
                "parent": {
                    "initial": "child",
                    "on": {"GO": "other"},
                    "states": {"child": {"on": {"GO": "sibling"}}, "sibling": {}}
                },
                "other": {}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "GO");
        assert!(step.state.matches(&d, "parent.sibling"));
        assert_eq!(ids(&d, &step.exit_set), vec!["machine.parent.child"]);
    }

    #[test]
    fn test_failed_guard_falls_through_to_ancestor() {
        let d = def(json!({
            "initial": "parent",
            "context": {"allowed": false},
            "states": {
                "parent": {
                    "initial": "child",
                    "on": {"GO": "other"},
                    "states": {"child": {"on": {"GO": {"target": "sibling", "guard": {"expr": "ctx.allowed"}}}}, "sibling": {}}
                },
                "other": {}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "GO");
        assert!(step.state.matches(&d, "other"));
    }

    #[test]
    fn test_guard_error_treated_as_false() {
        let impls = Implementations::new()
            .with_guard("broken", |_, _| Err(GuardError::new("broken", "lookup failed")));
        let d = def_with(
            json!({
                "initial": "a",
                "states": {
                    "a": {"on": {"GO": [{"target": "b", "guard": "broken"}, {"target": "c"}]}},
                    "b": {}, "c": {}
                }
            }),
            &impls,
        );
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "GO");
        assert!(step.state.matches(&d, "c"));
    }

    #[test]
    fn test_targetless_transition_keeps_configuration() {
        let d = def(json!({
            "initial": "a",
            "context": {"count": 0},
            "states": {
                "a": {
                    "entry": {"type": "log", "message": "entered"},
                    "on": {"BUMP": {"actions": {"type": "assign", "set": {"count": 1}}}}
                }
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "BUMP");
        assert!(step.exit_set.is_empty());
        assert!(step.entry_set.is_empty());
        assert!(step.effects.is_empty());
        assert_eq!(step.state.configuration, state.configuration);
        assert_eq!(*step.state.context, json!({"count": 1}));
        assert!(step.changed);
    }

    #[test]
    fn test_self_transition_reenters() {
        let d = def(json!({
            "initial": "a",
            "states": {"a": {"entry": {"type": "log", "message": "in"}, "exit": {"type": "log", "message": "out"}, "on": {"AGAIN": "a"}}}
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "AGAIN");
        let names: Vec<String> = step
            .effects
            .iter()
            .map(|e| match e {
                Effect::Log { message } => message.clone(),
                other => other.name().to_string(),
            })
            .collect();
        assert_eq!(names, vec!["out", "in"]);
    }

    #[test]
    fn test_child_target_does_not_exit_source_unless_reenter() {
        let d = def(json!({
            "initial": "p",
            "states": {
                "p": {
                    "initial": "x",
                    "exit": {"type": "log", "message": "p-exit"},
                    "on": {
                        "INNER": ".y",
                        "OUTER": {"target": ".y", "reenter": true}
                    },
                    "states": {"x": {}, "y": {}}
                }
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);

        let inner = send(&resolver, &state, "INNER");
        assert_eq!(ids(&d, &inner.exit_set), vec!["machine.p.x"]);
        assert_eq!(ids(&d, &inner.entry_set), vec!["machine.p.y"]);

        let outer = send(&resolver, &state, "OUTER");
        assert_eq!(ids(&d, &outer.exit_set), vec!["machine.p.x", "machine.p"]);
        assert_eq!(ids(&d, &outer.entry_set), vec!["machine.p", "machine.p.y"]);
    }

    #[test]
    fn test_action_order_and_assign_composition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let impls = Implementations::new()
            .with_assign("double", |ctx, _| json!({"n": ctx["n"].as_i64().unwrap_or(0) * 2}))
            .with_action("record", move |args| {
                recorder.lock().unwrap().push(args.context["n"].as_i64().unwrap_or(-1));
                Ok(())
            });
        let d = def_with(
            json!({
                "initial": "a",
                "context": {"n": 1},
                "states": {
                    "a": {"exit": ["record", {"type": "assign", "set": {"n": 2}}], "on": {"GO": {"target": "b", "actions": ["double", "record"]}}},
                    "b": {"entry": [{"type": "assign", "set": {"n": 10}}, "record"]}
                }
            }),
            &impls,
        );
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "GO");

        // Custom effects capture the context as of their position
        let captured: Vec<i64> = step
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Custom { context, .. } => context["n"].as_i64(),
                _ => None,
            })
            .collect();
        assert_eq!(captured, vec![1, 4, 10]);
        assert_eq!(*step.state.context, json!({"n": 10}));

        let probe = NoopSender;
        for effect in &step.effects {
            if let Effect::Custom { exec, context, event, .. } = effect {
                exec(&crate::action::ActionArgs { context, event, actor: &probe }).unwrap();
            }
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 4, 10]);
    }

    #[test]
    fn test_parallel_regions_both_transition() {
        let d = def(json!({
            "type": "parallel",
            "states": {
                "a": {"initial": "a1", "states": {"a1": {"on": {"E": "a2"}}, "a2": {}}},
                "b": {"initial": "b1", "states": {"b1": {"on": {"E": "b2"}}, "b2": {}}}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let event = Event::new("E");
        let enabled = resolver.select_transitions(&state, &event);
        assert_eq!(enabled.len(), 2);
        let step = resolver.microstep(&state, &event, &enabled);
        assert!(step.state.matches(&d, "a.a2"));
        assert!(step.state.matches(&d, "b.b2"));
        assert!(step.state.is_consistent(&d));
    }

    #[test]
    fn test_ancestor_transition_wins_conflict() {
        let d = def(json!({
            "initial": "p",
            "states": {
                "p": {
                    "type": "parallel",
                    "on": {"E": "out"},
                    "states": {
                        "a": {"initial": "a1", "states": {"a1": {"on": {"E": "a2"}}, "a2": {}}},
                        "b": {"initial": "b1", "states": {"b1": {}}}
                    }
                },
                "out": {}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let event = Event::new("E");
        let enabled = resolver.select_transitions(&state, &event);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source, d.find("p").unwrap());
        let step = resolver.microstep(&state, &event, &enabled);
        assert!(step.state.matches(&d, "out"));
        assert!(step.state.is_consistent(&d));
    }

    #[test]
    fn test_shallow_history_restores_substate() {
        let d = def(json!({
            "initial": "region",
            "states": {
                "region": {
                    "initial": "first",
                    "on": {"LEAVE": "away"},
                    "states": {
                        "first": {"on": {"NEXT": "second"}},
                        "second": {},
                        "hist": {"type": "history"}
                    }
                },
                "away": {"on": {"BACK": "region.hist", "RESET": "region"}}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let state = send(&resolver, &state, "NEXT").state;
        let state = send(&resolver, &state, "LEAVE").state;
        assert!(state.matches(&d, "away"));

        let restored = send(&resolver, &state, "BACK").state;
        assert!(restored.matches(&d, "region.second"));
        assert!(restored.is_consistent(&d));

        let reset = send(&resolver, &state, "RESET").state;
        assert!(reset.matches(&d, "region.first"));
    }

    #[test]
    fn test_history_default_and_deep_history() {
        let d = def(json!({
            "initial": "region",
            "states": {
                "region": {
                    "initial": "outer",
                    "on": {"LEAVE": "away"},
                    "states": {
                        "outer": {
                            "initial": "i1",
                            "on": {"DIVE": ".i2"},
                            "states": {"i1": {}, "i2": {}}
                        },
                        "deep": {"type": "history", "history": "deep"},
                        "shallow": {"type": "history", "target": "outer"}
                    }
                },
                "away": {"on": {"DEEP": "region.deep", "SHALLOW": "region.shallow"}}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);

        let dived = send(&resolver, &state, "DIVE").state;
        let away = send(&resolver, &dived, "LEAVE").state;

        let deep = send(&resolver, &away, "DEEP").state;
        assert!(deep.matches(&d, "region.outer.i2"));

        // Shallow history only remembers `outer`, so its default child is entered
        let shallow = send(&resolver, &away, "SHALLOW").state;
        assert!(shallow.matches(&d, "region.outer.i1"));
    }

    #[test]
    fn test_done_state_events() {
        let d = def(json!({
            "id": "m",
            "initial": "work",
            "states": {
                "work": {
                    "initial": "busy",
                    "states": {"busy": {"on": {"FINISH": "finished"}}, "finished": {"type": "final", "output": {"ok": true}}}
                }
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "FINISH");
        assert_eq!(step.raised, vec![Event::done_state("m.work", json!({"ok": true}))]);
        assert_eq!(step.state.status, Status::Active);
    }

    #[test]
    fn test_parallel_join_raised_once() {
        let d = def(json!({
            "id": "m",
            "type": "parallel",
            "states": {
                "a": {"initial": "a1", "states": {"a1": {"on": {"E": "a2"}}, "a2": {"type": "final"}}},
                "b": {"initial": "b1", "states": {"b1": {"on": {"E": "b2", "F": "b2"}}, "b2": {"type": "final"}}}
            }
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);

        // Both regions finish in the same microstep
        let step = send(&resolver, &state, "E");
        let done_root: Vec<&Event> = step
            .raised
            .iter()
            .filter(|e| e.event_type == "done.state.m")
            .collect();
        assert_eq!(done_root.len(), 1);
        assert_eq!(step.state.status, Status::Done);

        // Only one region final: no join yet
        let step = send(&resolver, &state, "F");
        assert!(!step.raised.iter().any(|e| e.event_type == "done.state.m"));
        assert_eq!(step.state.status, Status::Active);
    }

    #[test]
    fn test_top_level_final_sets_output() {
        let d = def(json!({
            "initial": "a",
            "states": {"a": {"on": {"END": "end"}}, "end": {"type": "final", "output": {"result": 42}}}
        }));
        let resolver = Resolver::new(&d);
        let state = initial(&resolver);
        let step = send(&resolver, &state, "END");
        assert_eq!(step.state.status, Status::Done);
        assert_eq!(step.state.output, Some(json!({"result": 42})));
        assert!(step.raised.is_empty());
    }

    #[test]
    fn test_invoke_and_spawn_owners() {
        let impls = Implementations::new().with_actor("worker");
        let d = def_with(
            json!({
                "initial": "idle",
                "entry": {"type": "spawn", "id": "root-child", "src": "worker", "assign_ref": "rootRef"},
                "states": {
                    "idle": {"on": {"GO": {"target": "busy", "actions": {"type": "spawn", "id": "t", "src": "worker"}}}},
                    "busy": {
                        "invoke": {"id": "job", "src": "worker", "input": {"n": 1}},
                        "on": {"DONE": "idle", "PING": {"actions": {"type": "spawn", "id": "p", "src": "worker"}}}
                    }
                }
            }),
            &impls,
        );
        let resolver = Resolver::new(&d);
        let start = MachineState::pre_initial(json!({}));
        let init = resolver.step(&start, &Event::init(), &[], true);
        assert!(matches!(
            &init.effects[0],
            Effect::Spawn { id, owner, .. } if id == "root-child" && *owner == StateId::ROOT
        ));
        assert_eq!(init.state.context["rootRef"], json!("root-child"));

        let busy = d.find("busy").unwrap();
        let step = send(&resolver, &init.state, "GO");
        let spawns: Vec<(String, StateId)> = step
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Spawn { id, owner, .. } => Some((id.clone(), *owner)),
                _ => None,
            })
            .collect();
        assert_eq!(spawns, vec![("t".to_string(), StateId::ROOT), ("job".to_string(), busy)]);

        let ping = send(&resolver, &step.state, "PING");
        assert!(matches!(&ping.effects[0], Effect::Spawn { owner, .. } if *owner == busy));

        let back = send(&resolver, &step.state, "DONE");
        assert!(matches!(&back.effects[0], Effect::Stop { id } if id == "job"));
    }

    #[test]
    fn test_action_error_surfaces_from_effect() {
        let impls = Implementations::new()
            .with_action("explode", |_| Err(ActionError::new("explode", "boom")));
        let d = def_with(json!({"initial": "a", "states": {"a": {"entry": "explode"}}}), &impls);
        let resolver = Resolver::new(&d);
        let start = MachineState::pre_initial(json!({}));
        let step = resolver.step(&start, &Event::init(), &[], true);
        let Effect::Custom { exec, context, event, .. } = &step.effects[0] else {
            panic!("expected custom effect");
        };
        let args = crate::action::ActionArgs {
            context,
            event,
            actor: &NoopSender,
        };
        let err = exec(&args).unwrap_err();
        assert_eq!(err.action, "explode");
    }

    struct NoopSender;

    impl crate::action::EventSender for NoopSender {
        fn id(&self) -> &str {
            "test"
        }
        fn send(&self, _event: Event) {}
        fn send_to(&self, _child: &str, _event: Event) {}
    }
}
