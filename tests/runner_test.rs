//! Queue walker scenarios driven end to end with a scripted page driver and
//! an in-memory image store. Redis persistence points at a closed port; the
//! runner tolerates persistence failures by design, so these tests need no
//! external services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use imagine_batch::app_state::AppState;
use imagine_batch::models::job::{JobStatus, RunOptions};
use imagine_batch::models::state::JobState;
use imagine_batch::routes::images::{clear_images, remove_image};
use imagine_batch::services::download::Downloader;
use imagine_batch::services::driver::{DispatchedItem, DriverError, ItemOutcome, PageDriver};
use imagine_batch::services::runner::{Runner, RunnerCommand, RunnerHandle};
use imagine_batch::services::state_store::StateStore;
use imagine_batch::services::store::{BlobStore, StoreError};

/// Points at a closed loopback port; every save fails fast and is logged.
const DEAD_REDIS: &str = "redis://127.0.0.1:1";

#[derive(Default)]
struct MemoryStore {
    blobs: Mutex<HashMap<Uuid, Vec<u8>>>,
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, id: Uuid, data: &[u8], _content_type: &str) -> Result<(), StoreError> {
        self.blobs.lock().await.insert(id, data.to_vec());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::Config(format!("missing blob {id}")))
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.blobs.lock().await.remove(&id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

enum Behavior {
    Succeed(String),
    FailUpload,
    /// Outlives any sane watchdog; only the watchdog ends this attempt.
    Hang,
}

#[derive(Clone, Default)]
struct DriverLog {
    calls: Arc<std::sync::Mutex<Vec<(usize, tokio::time::Instant)>>>,
    resets: Arc<AtomicUsize>,
}

impl DriverLog {
    fn calls(&self) -> Vec<(usize, tokio::time::Instant)> {
        self.calls.lock().unwrap().clone()
    }
}

struct ScriptedDriver {
    log: DriverLog,
    /// Behaviors per index, consumed one per attempt.
    script: HashMap<usize, Vec<Behavior>>,
}

impl ScriptedDriver {
    fn new(log: DriverLog, script: HashMap<usize, Vec<Behavior>>) -> Self {
        Self { log, script }
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn process(&mut self, item: &DispatchedItem) -> Result<ItemOutcome, DriverError> {
        self.log
            .calls
            .lock()
            .unwrap()
            .push((item.index, tokio::time::Instant::now()));

        let behavior = match self.script.get_mut(&item.index) {
            Some(list) if !list.is_empty() => list.remove(0),
            _ => Behavior::Succeed(format!("https://cdn.test/video-{}.mp4", item.index)),
        };

        match behavior {
            Behavior::Succeed(url) => Ok(ItemOutcome { video_url: url }),
            Behavior::FailUpload => Err(DriverError::UploadFailed("scripted failure".into())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err(DriverError::GenerationNotDetected("hang ran to completion".into()))
            }
        }
    }

    async fn fetch_video(&self, _url: &str) -> Result<Vec<u8>, DriverError> {
        Ok(b"video-bytes".to_vec())
    }

    fn reset(&mut self) {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    jobs: Arc<RwLock<JobState>>,
    handle: RunnerHandle,
    log: DriverLog,
    dir: tempfile::TempDir,
}

async fn harness(
    names: &[&str],
    script: HashMap<usize, Vec<Behavior>>,
    watchdog: Duration,
) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let mut state = JobState::default();
    for (i, name) in names.iter().enumerate() {
        let id = Uuid::new_v4();
        store.blobs.lock().await.insert(id, vec![i as u8; 16]);
        state.push_item(id, *name);
    }
    let jobs = Arc::new(RwLock::new(state));

    let log = DriverLog::default();
    let driver = ScriptedDriver::new(log.clone(), script);
    let dir = tempfile::tempdir().unwrap();

    let handle = Runner::spawn(
        Arc::clone(&jobs),
        store,
        Arc::new(StateStore::new(DEAD_REDIS).unwrap()),
        Box::new(driver),
        Downloader::new(dir.path()),
        watchdog,
    );

    Harness { jobs, handle, log, dir }
}

async fn wait_until(jobs: &Arc<RwLock<JobState>>, pred: impl Fn(&JobState) -> bool) {
    for _ in 0..20_000 {
        {
            let state = jobs.read().await;
            if pred(&state) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

fn saved_files(dir: &tempfile::TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test(start_paused = true)]
async fn three_items_two_complete_one_fails_upload() {
    let script = HashMap::from([
        (0, vec![Behavior::Succeed("https://cdn.test/a.mp4".into())]),
        (1, vec![Behavior::Succeed("https://cdn.test/b.mp4".into())]),
        (2, vec![Behavior::FailUpload]),
    ]);
    let h = harness(&["one.png", "two.png", "three.png"], script, Duration::from_secs(120)).await;

    assert!(h.handle.send(RunnerCommand::Start(RunOptions::default())).await);
    wait_until(&h.jobs, |s| !s.processing && s.started_at.is_some()).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 2);
    assert_eq!(state.stats.failed, 1);
    assert_eq!(state.cursor, 3);
    assert_eq!(state.items[0].status, JobStatus::Completed);
    assert_eq!(state.items[1].status, JobStatus::Completed);
    assert_eq!(state.items[2].status, JobStatus::Failed);

    let report: Vec<String> = state.completion_report().lines().map(String::from).collect();
    assert_eq!(
        report,
        vec![
            "Index;Name;Status",
            "1;one.png;completed",
            "2;two.png;completed",
            "3;three.png;failed",
        ]
    );

    assert_eq!(saved_files(&h.dir), vec!["one.mp4", "two.mp4"]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_result_url_is_downloaded_once() {
    // The site hands back the same render for both items; the second item
    // still completes but nothing is fetched twice.
    let url = "https://cdn.test/same.mp4".to_string();
    let script = HashMap::from([
        (0, vec![Behavior::Succeed(url.clone())]),
        (1, vec![Behavior::Succeed(url.clone())]),
    ]);
    let h = harness(&["a.png", "b.png"], script, Duration::from_secs(120)).await;

    assert!(h.handle.send(RunnerCommand::Start(RunOptions::default())).await);
    wait_until(&h.jobs, |s| !s.processing && s.started_at.is_some()).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 2);
    assert_eq!(state.stats.failed, 0);
    assert_eq!(state.downloaded_urls.len(), 1);
    assert_eq!(saved_files(&h.dir), vec!["a.mp4"]);
}

#[tokio::test(start_paused = true)]
async fn periodic_pause_holds_then_resumes_at_unchanged_cursor() {
    let h = harness(&["a.png", "b.png", "c.png"], HashMap::new(), Duration::from_secs(120)).await;

    let options = RunOptions {
        pause_every: 2,
        pause_duration_secs: 5,
        ..Default::default()
    };
    assert!(h.handle.send(RunnerCommand::Start(options)).await);
    wait_until(&h.jobs, |s| !s.processing && s.started_at.is_some()).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 3);
    assert!(!state.paused, "pause auto-clears after its duration");
    assert!(state.pause_until.is_none());

    // Dispatch order is strict and the pause sits between the 2nd
    // completion and the 3rd dispatch.
    let calls = h.log.calls();
    let indices: Vec<usize> = calls.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let gap_01 = calls[1].1 - calls[0].1;
    let gap_12 = calls[2].1 - calls[1].1;
    assert!(gap_01 < Duration::from_secs(3), "no pause before the 2nd item");
    assert!(gap_12 >= Duration::from_secs(5), "5s pause before the 3rd item");
}

#[tokio::test(start_paused = true)]
async fn watchdog_restarts_stalled_item_without_advancing() {
    let script = HashMap::from([(
        0,
        vec![
            Behavior::Hang,
            Behavior::Succeed("https://cdn.test/late.mp4".into()),
        ],
    )]);
    let h = harness(&["slow.png"], script, Duration::from_secs(2)).await;

    assert!(h.handle.send(RunnerCommand::Start(RunOptions::default())).await);
    wait_until(&h.jobs, |s| !s.processing && s.started_at.is_some()).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 1);
    assert_eq!(state.stats.failed, 0);
    assert_eq!(state.cursor, 1);
    assert!(!state.stuck);

    // Same index dispatched twice with a session reset in between.
    let indices: Vec<usize> = h.log.calls().iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![0, 0]);
    assert!(h.log.resets.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_tears_down_the_in_flight_item() {
    let script = HashMap::from([(0, vec![Behavior::Hang])]);
    let h = harness(&["a.png", "b.png"], script, Duration::from_secs(120)).await;

    assert!(h.handle.send(RunnerCommand::Start(RunOptions::default())).await);

    // Let the first item get dispatched, then cancel while it hangs.
    wait_until(&h.jobs, |s| s.item_started_at.is_some()).await;
    assert!(h.handle.send(RunnerCommand::Cancel).await);
    wait_until(&h.jobs, |s| !s.processing).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 0);
    assert_eq!(state.stats.failed, 0);
    assert!(!state.paused);
    assert!(state.item_started_at.is_none());
    assert!(h.log.resets.load(Ordering::SeqCst) >= 1);
    assert!(saved_files(&h.dir).is_empty());
}

#[test]
fn driver_trait_objects_are_shareable_across_tasks() {
    fn assert_bounds<T: Send + Sync>() {}
    assert_bounds::<Box<dyn PageDriver>>();
}

#[tokio::test(start_paused = true)]
async fn queue_emptied_mid_run_ends_the_walk_cleanly() {
    // First attempt hangs so the queue can be emptied while the item is in
    // flight; the late completion then points at an index that no longer
    // exists and the walk must end without panicking or counting anything.
    let script = HashMap::from([(
        0,
        vec![
            Behavior::Hang,
            Behavior::Succeed("https://cdn.test/late.mp4".into()),
        ],
    )]);
    let h = harness(&["a.png", "b.png"], script, Duration::from_secs(2)).await;

    assert!(h.handle.send(RunnerCommand::Start(RunOptions::default())).await);
    wait_until(&h.jobs, |s| s.item_started_at.is_some()).await;

    {
        let mut state = h.jobs.write().await;
        let ids: Vec<Uuid> = state.items.iter().map(|item| item.id).collect();
        for id in ids {
            state.remove_item(id);
        }
    }

    wait_until(&h.jobs, |s| !s.processing).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 0, "completion for a removed item is ignored");
    assert_eq!(state.stats.failed, 0);
    assert!(state.items.is_empty());

    // The runner task survived and still accepts commands.
    drop(state);
    assert!(h.handle.send(RunnerCommand::TogglePause).await);
}

#[tokio::test(start_paused = true)]
async fn queue_mutation_is_rejected_while_a_run_is_active() {
    let store = Arc::new(MemoryStore::default());
    let mut state = JobState::default();
    let id = Uuid::new_v4();
    store.blobs.lock().await.insert(id, vec![1u8; 16]);
    state.push_item(id, "a.png");
    let jobs = Arc::new(RwLock::new(state));

    let state_store = Arc::new(StateStore::new(DEAD_REDIS).unwrap());
    let log = DriverLog::default();
    let script = HashMap::from([(0, vec![Behavior::Hang])]);
    let dir = tempfile::tempdir().unwrap();

    let handle = Runner::spawn(
        Arc::clone(&jobs),
        Arc::clone(&store) as Arc<dyn BlobStore>,
        Arc::clone(&state_store),
        Box::new(ScriptedDriver::new(log, script)),
        Downloader::new(dir.path()),
        Duration::from_secs(120),
    );
    let app = AppState::new(store, state_store, Arc::clone(&jobs), handle.clone());

    assert!(handle.send(RunnerCommand::Start(RunOptions::default())).await);
    wait_until(&jobs, |s| s.processing).await;

    assert_eq!(
        remove_image(State(app.clone()), Path(id)).await,
        Err(StatusCode::CONFLICT)
    );
    assert_eq!(clear_images(State(app.clone())).await, StatusCode::CONFLICT);
    assert_eq!(jobs.read().await.items.len(), 1, "queue untouched");

    // Once the run is cancelled the same removal goes through.
    assert!(handle.send(RunnerCommand::Cancel).await);
    wait_until(&jobs, |s| !s.processing).await;
    assert_eq!(
        remove_image(State(app), Path(id)).await,
        Ok(StatusCode::NO_CONTENT)
    );
    assert!(jobs.read().await.items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_payload_fails_the_item_and_continues() {
    let h = harness(&["kept.png"], HashMap::new(), Duration::from_secs(120)).await;

    // Queue a second item whose payload never made it into the store.
    {
        let mut state = h.jobs.write().await;
        state.push_item(Uuid::new_v4(), "ghost.png");
    }

    assert!(h.handle.send(RunnerCommand::Start(RunOptions::default())).await);
    wait_until(&h.jobs, |s| !s.processing && s.started_at.is_some()).await;

    let state = h.jobs.read().await;
    assert_eq!(state.stats.completed, 1);
    assert_eq!(state.stats.failed, 1);
    assert_eq!(state.items[1].status, JobStatus::Failed);
}
