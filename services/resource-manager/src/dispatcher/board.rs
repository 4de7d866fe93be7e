//! Status board: the query side of the dispatcher.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rm_events::{EntityId, EntityKind, EntityState};

use crate::controller::EntityStatus;

/// Latest known status of every live entity, plus the most recent
/// terminal ones.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<BoardInner>>,
}

struct BoardInner {
    entries: HashMap<EntityId, EntityStatus>,
    completed: VecDeque<EntityId>,
    retention: usize,
}

impl StatusBoard {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoardInner {
                entries: HashMap::new(),
                completed: VecDeque::new(),
                retention,
            })),
        }
    }

    pub fn get(&self, entity: &EntityId) -> Option<EntityStatus> {
        self.read().entries.get(entity).cloned()
    }

    pub fn get_state(&self, entity: &EntityId) -> Option<EntityState> {
        self.read().entries.get(entity).map(|s| s.state)
    }

    pub fn get_diagnostics(&self, entity: &EntityId) -> Option<Vec<String>> {
        self.read().entries.get(entity).map(|s| s.diagnostics.clone())
    }

    /// Number of known entities of `kind` that are not terminal.
    pub fn live_count(&self, kind: EntityKind) -> usize {
        self.read()
            .entries
            .iter()
            .filter(|(id, s)| id.kind() == kind && !s.state.is_terminal())
            .count()
    }

    pub(crate) fn update(&self, entity: EntityId, status: EntityStatus) {
        let mut inner = self.write();
        let terminal = status.state.is_terminal();
        let previous = inner.entries.insert(entity, status);
        let was_terminal = previous.is_some_and(|p| p.state.is_terminal());

        if terminal && !was_terminal {
            inner.completed.push_back(entity);
            while inner.completed.len() > inner.retention {
                if let Some(evicted) = inner.completed.pop_front() {
                    inner.entries.remove(&evicted);
                }
            }
        }
    }

    // A panicking writer cannot leave a half-written entry, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, BoardInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BoardInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_events::{AttemptState, ContainerState};
    use rm_id::{AppId, AttemptId, ContainerId};

    fn status(state: EntityState) -> EntityStatus {
        EntityStatus {
            state,
            diagnostics: vec![format!("now {state}")],
        }
    }

    #[test]
    fn test_update_and_query() {
        let board = StatusBoard::new(4);
        let attempt = EntityId::Attempt(AttemptId::new(AppId::new(), 1));

        assert_eq!(board.get_state(&attempt), None);

        board.update(attempt, status(EntityState::Attempt(AttemptState::Running)));
        assert_eq!(
            board.get_state(&attempt),
            Some(EntityState::Attempt(AttemptState::Running))
        );
        assert_eq!(
            board.get_diagnostics(&attempt),
            Some(vec!["now RUNNING".to_string()])
        );
        assert_eq!(board.live_count(EntityKind::Attempt), 1);
        assert_eq!(board.live_count(EntityKind::Container), 0);
    }

    #[test]
    fn test_terminal_entries_are_bounded() {
        let board = StatusBoard::new(2);
        let ids: Vec<EntityId> = (0..3).map(|_| EntityId::Container(ContainerId::new())).collect();

        for id in &ids {
            board.update(*id, status(EntityState::Container(ContainerState::Running)));
            board.update(*id, status(EntityState::Container(ContainerState::Done)));
            // a repeated terminal update does not count twice
            board.update(*id, status(EntityState::Container(ContainerState::Done)));
        }

        assert_eq!(board.get_state(&ids[0]), None);
        assert!(board.get_state(&ids[1]).is_some());
        assert!(board.get_state(&ids[2]).is_some());
    }
}
