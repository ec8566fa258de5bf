//! Macrostep driver.
//!
//! One external event triggers a macrostep: the microstep for the event
//! itself, then microsteps for eventless transitions and raised events until
//! neither is left. Eventless transitions are checked before every pop of
//! the internal queue.

use crate::action::Effect;
use crate::error::CoreError;
use crate::event::Event;
use crate::resolver::{Microstep, Resolver};
use crate::state::{MachineState, Status};
use serde_json::Value;
use std::collections::VecDeque;

/// Result of running one event to quiescence.
#[derive(Debug)]
pub struct Macrostep {
    pub state: MachineState,
    /// Effects grouped by microstep, in execution order.
    pub microsteps: Vec<Vec<Effect>>,
    /// Every event raised during the macrostep, consumed or not.
    pub raised: Vec<Event>,
    /// Whether any microstep changed configuration, context or status.
    pub changed: bool,
    /// Set when the macrostep diverged.
    pub error: Option<CoreError>,
}

impl Macrostep {
    fn unchanged(state: MachineState) -> Self {
        Self {
            state,
            microsteps: Vec::new(),
            raised: Vec::new(),
            changed: false,
            error: None,
        }
    }

    /// Effects of all microsteps, flattened.
    pub fn effects(&self) -> impl Iterator<Item = &Effect> {
        self.microsteps.iter().flatten()
    }

    fn record(&mut self, queue: &mut VecDeque<Event>, step: Microstep) {
        self.changed |= step.changed;
        queue.extend(step.raised.iter().cloned());
        self.raised.extend(step.raised);
        self.microsteps.push(step.effects);
        self.state = step.state;
    }
}

impl<'a> Resolver<'a> {
    /// Enters the initial configuration and runs it to quiescence.
    /// `context` overrides the definition's initial context.
    pub fn initial_state(&self, context: Option<Value>) -> Macrostep {
        let start =
            MachineState::pre_initial(context.unwrap_or_else(|| self.def.initial_context()));
        let init = Event::init();
        let first = self.step(&start, &init, &[], true);

        let mut run = Macrostep::unchanged(start);
        let mut queue = VecDeque::new();
        run.record(&mut queue, first);
        self.settle(run, queue, &init)
    }

    /// Processes one external event.
    ///
    /// A machine that is no longer active ignores events, as does an active
    /// one where nothing is enabled; either way the returned state is a clone
    /// of the input sharing its context.
    pub fn macrostep(&self, state: &MachineState, event: &Event) -> Macrostep {
        if state.status != Status::Active {
            tracing::debug!(
                machine = %self.def.id,
                event = %event.event_type,
                status = ?state.status,
                "Event ignored by inactive machine"
            );
            return Macrostep::unchanged(state.clone());
        }

        let mut run = Macrostep::unchanged(state.clone());
        let mut queue = VecDeque::new();
        let enabled = self.select_transitions(state, event);
        if !enabled.is_empty() {
            let step = self.microstep(state, event, &enabled);
            run.record(&mut queue, step);
        }
        self.settle(run, queue, event)
    }

    fn settle(&self, mut run: Macrostep, mut queue: VecDeque<Event>, trigger: &Event) -> Macrostep {
        let limit = self.config.max_microsteps;

        while run.state.status == Status::Active {
            let mut enabled = self.select_eventless_transitions(&run.state);
            let mut event = run.state.event.clone();

            if enabled.is_empty() {
                let Some(internal) = queue.pop_front() else {
                    break;
                };
                enabled = self.select_transitions(&run.state, &internal);
                if enabled.is_empty() {
                    continue;
                }
                event = internal;
            }

            if run.microsteps.len() >= limit {
                let error = CoreError::MacrostepDivergence {
                    limit,
                    event: trigger.event_type.clone(),
                };
                tracing::warn!(machine = %self.def.id, error = %error, "Macrostep diverged");
                run.state.status = Status::Error;
                run.state.error = Some(error.to_string());
                run.changed = true;
                run.error = Some(error);
                break;
            }

            let step = self.microstep(&run.state, &event, &enabled);
            run.record(&mut queue, step);
        }

        run
    }
}
