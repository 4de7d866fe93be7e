//! Declarative transition tables.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use crate::HookError;

/// Side effect of a single-target arc. `O` is the entity operand, `E` the event.
pub type Hook<O, E> = fn(&mut O, &E) -> Result<(), HookError>;

/// Side effect of a multi-target arc; returns the chosen next state.
pub type ChoiceHook<O, E, S> = fn(&mut O, &E) -> Result<S, HookError>;

pub(crate) enum Edge<S, O, E> {
    Single { to: S, hook: Option<Hook<O, E>> },
    Choice { targets: Vec<S>, hook: ChoiceHook<O, E, S> },
    Ignore,
}

/// Immutable mapping from `(state, tag)` to an edge.
///
/// Built once per entity kind, usually into a `static LazyLock`, and shared
/// by every machine of that kind.
pub struct TransitionTable<S, T, O, E> {
    initial: S,
    terminal: HashSet<S>,
    states: HashSet<S>,
    arcs: HashMap<(S, T), Edge<S, O, E>>,
    absorbed: HashSet<T>,
}

impl<S, T, O, E> TransitionTable<S, T, O, E>
where
    S: Copy + Eq + Hash + Debug,
    T: Copy + Eq + Hash + Debug,
{
    pub fn builder(initial: S, terminal: &[S]) -> TableBuilder<S, T, O, E> {
        TableBuilder::new(initial, terminal)
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Every state the table can put a machine in.
    pub fn states(&self) -> &HashSet<S> {
        &self.states
    }

    /// Tags that drive into a terminal state from somewhere; these are
    /// absorbed as no-ops once a machine is terminal.
    pub fn is_absorbed(&self, event: T) -> bool {
        self.absorbed.contains(&event)
    }

    /// Returns true if `event` has an edge (or explicit ignore) from `state`.
    pub fn accepts(&self, state: S, event: T) -> bool {
        self.arcs.contains_key(&(state, event))
            || (self.is_terminal(state) && self.is_absorbed(event))
    }

    pub(crate) fn arc(&self, state: S, event: T) -> Option<&Edge<S, O, E>> {
        self.arcs.get(&(state, event))
    }
}

/// Builder for [`TransitionTable`].
///
/// # Panics
///
/// Registering a second edge for the same `(state, tag)` pair, or an edge out
/// of a terminal state, panics: both are table-construction bugs. Explicit
/// ignores count as edges.
pub struct TableBuilder<S, T, O, E> {
    initial: S,
    terminal: HashSet<S>,
    arcs: HashMap<(S, T), Edge<S, O, E>>,
}

impl<S, T, O, E> TableBuilder<S, T, O, E>
where
    S: Copy + Eq + Hash + Debug,
    T: Copy + Eq + Hash + Debug,
{
    pub fn new(initial: S, terminal: &[S]) -> Self {
        Self {
            initial,
            terminal: terminal.iter().copied().collect(),
            arcs: HashMap::new(),
        }
    }

    /// `from --on--> to` with no side effect.
    pub fn transition(mut self, from: &[S], to: S, on: T) -> Self {
        for &state in from {
            self.insert(state, on, Edge::Single { to, hook: None });
        }
        self
    }

    /// `from --on--> to`, running `hook` before committing.
    pub fn transition_with(mut self, from: &[S], to: S, on: T, hook: Hook<O, E>) -> Self {
        for &state in from {
            self.insert(
                state,
                on,
                Edge::Single {
                    to,
                    hook: Some(hook),
                },
            );
        }
        self
    }

    /// `from --on--> one of targets`, the target chosen by `hook`.
    pub fn choice(mut self, from: &[S], on: T, targets: &[S], hook: ChoiceHook<O, E, S>) -> Self {
        for &state in from {
            self.insert(
                state,
                on,
                Edge::Choice {
                    targets: targets.to_vec(),
                    hook,
                },
            );
        }
        self
    }

    /// Accepts each of `events` in each of `states` as a no-op.
    pub fn ignore(mut self, states: &[S], events: &[T]) -> Self {
        for &state in states {
            for &event in events {
                self.insert(state, event, Edge::Ignore);
            }
        }
        self
    }

    pub fn build(self) -> TransitionTable<S, T, O, E> {
        let mut states: HashSet<S> = HashSet::from([self.initial]);
        let mut absorbed = HashSet::new();

        for ((from, event), arc) in &self.arcs {
            states.insert(*from);
            let targets: &[S] = match arc {
                Edge::Single { to, .. } => std::slice::from_ref(to),
                Edge::Choice { targets, .. } => targets,
                Edge::Ignore => &[],
            };
            for target in targets {
                states.insert(*target);
                if self.terminal.contains(target) {
                    absorbed.insert(*event);
                }
            }
        }

        TransitionTable {
            initial: self.initial,
            terminal: self.terminal,
            states,
            arcs: self.arcs,
            absorbed,
        }
    }

    fn insert(&mut self, state: S, event: T, arc: Edge<S, O, E>) {
        assert!(
            !self.terminal.contains(&state),
            "edge out of terminal state {state:?} on {event:?}"
        );
        let previous = self.arcs.insert((state, event), arc);
        assert!(
            previous.is_none(),
            "duplicate edge for state {state:?} on {event:?}"
        );
    }
}
