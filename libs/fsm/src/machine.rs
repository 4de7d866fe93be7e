//! Per-entity state machine cursor.

use std::fmt::Debug;
use std::hash::Hash;

use crate::table::{Edge, TransitionTable};
use crate::TransitionError;

/// Result of a successfully applied event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S> {
    /// The machine moved (possibly to the same state on a self-loop).
    Transitioned { from: S, to: S },
    /// The event was accepted as a no-op.
    Ignored { state: S },
}

impl<S: Copy> Outcome<S> {
    /// State after the event.
    pub fn state(&self) -> S {
        match self {
            Outcome::Transitioned { to, .. } => *to,
            Outcome::Ignored { state } => *state,
        }
    }
}

/// Mutable cursor over a shared [`TransitionTable`].
///
/// Holds only the current state; everything else an entity owns lives in
/// the operand passed to [`StateMachine::apply`].
pub struct StateMachine<S: 'static, T: 'static, O: 'static, E: 'static> {
    table: &'static TransitionTable<S, T, O, E>,
    current: S,
}

impl<S, T, O, E> StateMachine<S, T, O, E>
where
    S: Copy + Eq + Hash + Debug + 'static,
    T: Copy + Eq + Hash + Debug + 'static,
    O: 'static,
    E: 'static,
{
    /// Creates a machine in the table's initial state.
    pub fn new(table: &'static TransitionTable<S, T, O, E>) -> Self {
        Self {
            table,
            current: table.initial(),
        }
    }

    pub fn current_state(&self) -> S {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.table.is_terminal(self.current)
    }

    /// Applies one event.
    ///
    /// The hook runs first; the next state is committed only if it succeeds.
    pub fn apply(
        &mut self,
        operand: &mut O,
        event: T,
        payload: &E,
    ) -> Result<Outcome<S>, TransitionError<S, T>> {
        let from = self.current;

        let Some(edge) = self.table.arc(from, event) else {
            if self.table.is_terminal(from) && self.table.is_absorbed(event) {
                return Ok(Outcome::Ignored { state: from });
            }
            return Err(TransitionError::InvalidTransition { state: from, event });
        };

        let to = match edge {
            Edge::Ignore => return Ok(Outcome::Ignored { state: from }),
            Edge::Single { to, hook } => {
                if let Some(hook) = hook {
                    hook(operand, payload).map_err(|source| TransitionError::Hook {
                        state: from,
                        event,
                        source,
                    })?;
                }
                *to
            }
            Edge::Choice { targets, hook } => {
                let target = hook(operand, payload).map_err(|source| TransitionError::Hook {
                    state: from,
                    event,
                    source,
                })?;
                if !targets.contains(&target) {
                    return Err(TransitionError::InvalidTarget {
                        state: from,
                        event,
                        target,
                    });
                }
                target
            }
        };

        self.current = to;
        Ok(Outcome::Transitioned { from, to })
    }
}

impl<S: Debug + 'static, T: 'static, O: 'static, E: 'static> Debug for StateMachine<S, T, O, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use proptest::prelude::*;

    use super::*;
    use crate::HookError;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Job {
        New,
        Running,
        Retrying,
        Done,
        Failed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Tag {
        Start,
        Fail,
        Finish,
        Kill,
        Poke,
    }

    #[derive(Default)]
    struct Counter {
        failures: u32,
        finishes: u32,
        reject_finish: bool,
    }

    fn on_finish(c: &mut Counter, _: &()) -> Result<(), HookError> {
        if c.reject_finish {
            return Err(HookError::new("not yet"));
        }
        c.finishes += 1;
        Ok(())
    }

    fn on_fail(c: &mut Counter, _: &()) -> Result<Job, HookError> {
        c.failures += 1;
        Ok(if c.failures >= 2 { Job::Failed } else { Job::Retrying })
    }

    fn bad_choice(_: &mut Counter, _: &()) -> Result<Job, HookError> {
        Ok(Job::New)
    }

    static TABLE: LazyLock<TransitionTable<Job, Tag, Counter, ()>> = LazyLock::new(|| {
        TransitionTable::builder(Job::New, &[Job::Done, Job::Failed])
            .transition(&[Job::New, Job::Retrying], Job::Running, Tag::Start)
            .choice(&[Job::Running], Tag::Fail, &[Job::Retrying, Job::Failed], on_fail)
            .transition_with(&[Job::Running], Job::Done, Tag::Finish, on_finish)
            .transition(&[Job::New, Job::Running, Job::Retrying], Job::Failed, Tag::Kill)
            .choice(&[Job::Retrying], Tag::Poke, &[Job::Running], bad_choice)
            .build()
    });

    fn machine() -> StateMachine<Job, Tag, Counter, ()> {
        StateMachine::new(&TABLE)
    }

    #[test]
    #[should_panic(expected = "duplicate edge")]
    fn test_ignore_cannot_shadow_an_edge() {
        let _ = TransitionTable::<Job, Tag, Counter, ()>::builder(Job::New, &[Job::Done])
            .transition(&[Job::New], Job::Running, Tag::Start)
            .ignore(&[Job::New], &[Tag::Start]);
    }

    #[test]
    #[should_panic(expected = "edge out of terminal state")]
    fn test_ignore_out_of_terminal_state_panics() {
        let _ = TransitionTable::<Job, Tag, Counter, ()>::builder(Job::New, &[Job::Done])
            .ignore(&[Job::Done], &[Tag::Poke]);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut m = machine();
        let mut c = Counter::default();
        let err = m.apply(&mut c, Tag::Finish, &()).unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(err.state(), Job::New);
        assert_eq!(err.event(), Tag::Finish);
        assert_eq!(m.current_state(), Job::New);
    }

    #[test]
    fn test_hook_failure_denies_partial_transition() {
        let mut m = machine();
        let mut c = Counter {
            reject_finish: true,
            ..Default::default()
        };
        m.apply(&mut c, Tag::Start, &()).unwrap();
        let err = m.apply(&mut c, Tag::Finish, &()).unwrap_err();
        assert!(matches!(err, TransitionError::Hook { .. }));
        assert_eq!(m.current_state(), Job::Running);

        c.reject_finish = false;
        let outcome = m.apply(&mut c, Tag::Finish, &()).unwrap();
        assert_eq!(
            outcome,
            Outcome::Transitioned {
                from: Job::Running,
                to: Job::Done
            }
        );
    }

    #[test]
    fn test_choice_hook_selects_target() {
        let mut m = machine();
        let mut c = Counter::default();
        m.apply(&mut c, Tag::Start, &()).unwrap();
        assert_eq!(m.apply(&mut c, Tag::Fail, &()).unwrap().state(), Job::Retrying);
        m.apply(&mut c, Tag::Start, &()).unwrap();
        assert_eq!(m.apply(&mut c, Tag::Fail, &()).unwrap().state(), Job::Failed);
        assert!(m.is_terminal());
    }

    #[test]
    fn test_undeclared_choice_target_rejected() {
        let mut m = machine();
        let mut c = Counter::default();
        m.apply(&mut c, Tag::Start, &()).unwrap();
        m.apply(&mut c, Tag::Fail, &()).unwrap();
        let err = m.apply(&mut c, Tag::Poke, &()).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidTarget {
                target: Job::New,
                ..
            }
        ));
        assert_eq!(m.current_state(), Job::Retrying);
    }

    #[test]
    fn test_terminal_absorbs_repeated_terminal_events() {
        let mut m = machine();
        let mut c = Counter::default();
        m.apply(&mut c, Tag::Kill, &()).unwrap();
        assert_eq!(
            m.apply(&mut c, Tag::Kill, &()).unwrap(),
            Outcome::Ignored { state: Job::Failed }
        );
        assert_eq!(
            m.apply(&mut c, Tag::Finish, &()).unwrap(),
            Outcome::Ignored { state: Job::Failed }
        );
        // Start never leads to a terminal state, so it is still a protocol error.
        assert!(m.apply(&mut c, Tag::Start, &()).unwrap_err().is_invalid_transition());
    }

    #[test]
    fn test_declared_states() {
        let states = TABLE.states();
        assert_eq!(states.len(), 5);
        assert!(TABLE.accepts(Job::Done, Tag::Kill));
        assert!(!TABLE.accepts(Job::Done, Tag::Start));
    }

    fn any_tag() -> impl Strategy<Value = Tag> {
        prop_oneof![
            Just(Tag::Start),
            Just(Tag::Fail),
            Just(Tag::Finish),
            Just(Tag::Kill),
            Just(Tag::Poke),
        ]
    }

    proptest! {
        #[test]
        fn never_leaves_declared_states_or_terminal(tags in prop::collection::vec(any_tag(), 0..64)) {
            let mut m = machine();
            let mut c = Counter::default();
            let mut terminal_at: Option<Job> = None;

            for tag in tags {
                let before = m.current_state();
                let result = m.apply(&mut c, tag, &());
                if result.is_err() {
                    prop_assert_eq!(m.current_state(), before);
                }
                prop_assert!(TABLE.states().contains(&m.current_state()));
                if let Some(t) = terminal_at {
                    prop_assert_eq!(m.current_state(), t);
                } else if m.is_terminal() {
                    terminal_at = Some(m.current_state());
                }
            }
        }
    }
}
