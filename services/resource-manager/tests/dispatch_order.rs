//! Per-entity ordering of events posted from many threads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use rm_core::controller::{ApplyError, EntityController, EntityStatus};
use rm_core::dispatcher::Dispatcher;
use rm_events::{AppEvent, AppState, EntityId, EntityState, EventEnvelope, EventPayload};
use rm_fsm::Outcome;
use rm_id::AppId;

const POSTERS: usize = 4;
const EVENTS_PER_POSTER: usize = 250;

/// Records the tag carried by every kill it receives.
struct Recorder {
    app_id: AppId,
    seen: Arc<Mutex<Vec<String>>>,
}

impl EntityController for Recorder {
    fn entity_id(&self) -> EntityId {
        self.app_id.into()
    }

    fn handle(&mut self, envelope: &EventEnvelope) -> Result<Outcome<EntityState>, ApplyError> {
        if let EventPayload::App(AppEvent::Kill { diagnostics }) = &envelope.payload {
            self.seen.lock().unwrap().push(diagnostics.clone());
        }
        Ok(Outcome::Ignored {
            state: AppState::Running.into(),
        })
    }

    fn status(&self) -> EntityStatus {
        EntityStatus {
            state: AppState::Running.into(),
            diagnostics: Vec::new(),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_posters_events_arrive_in_post_order() {
    let dispatcher = Dispatcher::start(4, 16);
    let handle = dispatcher.handle();

    let apps: Vec<AppId> = (0..3).map(|_| AppId::new()).collect();
    let mut logs = HashMap::new();
    for app_id in &apps {
        let seen = Arc::new(Mutex::new(Vec::new()));
        handle.register(Box::new(Recorder {
            app_id: *app_id,
            seen: seen.clone(),
        }));
        logs.insert(*app_id, seen);
    }

    let posters: Vec<_> = (0..POSTERS)
        .map(|poster| {
            let handle = handle.clone();
            let apps = apps.clone();
            thread::spawn(move || {
                for i in 0..EVENTS_PER_POSTER {
                    let app_id = apps[i % apps.len()];
                    handle.post_app(
                        app_id,
                        AppEvent::Kill {
                            diagnostics: format!("{poster}:{i}"),
                        },
                    );
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    handle.flush().await;

    let mut total = 0;
    for (app_id, seen) in &logs {
        let seen = seen.lock().unwrap();
        total += seen.len();

        let mut last: HashMap<usize, usize> = HashMap::new();
        for tag in seen.iter() {
            let (poster, i) = tag.split_once(':').unwrap();
            let poster: usize = poster.parse().unwrap();
            let i: usize = i.parse().unwrap();
            if let Some(prev) = last.insert(poster, i) {
                assert!(prev < i, "{app_id}: {poster} posted {prev} before {i}");
            }
        }
    }
    assert_eq!(total, POSTERS * EVENTS_PER_POSTER);
    assert_eq!(handle.posted(), (POSTERS * EVENTS_PER_POSTER) as u64);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_events_for_unknown_entities_are_dropped() {
    let dispatcher = Dispatcher::start(2, 16);
    let handle = dispatcher.handle();

    handle.post_app(
        AppId::new(),
        AppEvent::Kill {
            diagnostics: "nobody home".to_string(),
        },
    );
    handle.flush().await;

    assert_eq!(handle.posted(), 1);
    dispatcher.shutdown().await;
}
