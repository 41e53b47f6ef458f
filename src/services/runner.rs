//! Queue walker: advances the cursor through the queue one item at a time,
//! dispatching each to the page driver under a watchdog and applying the
//! completion to the shared job state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::models::job::RunOptions;
use crate::models::state::{Completion, JobState, NextAction};
use crate::services::download::Downloader;
use crate::services::driver::{DispatchedItem, DriverError, ItemOutcome, PageDriver};
use crate::services::state_store::StateStore;
use crate::services::store::BlobStore;

/// Delay between items once a completion has been applied.
const ITEM_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum RunnerCommand {
    Start(RunOptions),
    TogglePause,
    Cancel,
}

/// Cheap handle for submitting commands to the runner task.
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::Sender<RunnerCommand>,
}

impl RunnerHandle {
    /// Returns false when the runner task is gone.
    pub async fn send(&self, command: RunnerCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }
}

/// Outcome of one watchdog-guarded dispatch.
enum ItemVerdict {
    Done(Result<ItemOutcome, DriverError>),
    Cancelled,
}

pub struct Runner {
    jobs: Arc<RwLock<JobState>>,
    store: Arc<dyn BlobStore>,
    state_store: Arc<StateStore>,
    driver: Box<dyn PageDriver>,
    downloader: Downloader,
    options: RunOptions,
    watchdog: Duration,
    rx: mpsc::Receiver<RunnerCommand>,
}

impl Runner {
    /// Spawn the runner task and return its command handle.
    pub fn spawn(
        jobs: Arc<RwLock<JobState>>,
        store: Arc<dyn BlobStore>,
        state_store: Arc<StateStore>,
        driver: Box<dyn PageDriver>,
        downloader: Downloader,
        watchdog: Duration,
    ) -> RunnerHandle {
        let (tx, rx) = mpsc::channel(16);
        let runner = Runner {
            jobs,
            store,
            state_store,
            driver,
            downloader,
            options: RunOptions::default(),
            watchdog,
            rx,
        };
        tokio::spawn(runner.run());
        RunnerHandle { tx }
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                RunnerCommand::Start(options) => {
                    let total = {
                        let mut jobs = self.jobs.write().await;
                        jobs.begin_run();
                        jobs.items.len()
                    };
                    self.options = options;
                    self.persist().await;
                    tracing::info!(total, "starting batch run");
                    self.walk().await;
                }
                RunnerCommand::TogglePause => {
                    let (paused, processing) = {
                        let mut jobs = self.jobs.write().await;
                        let paused = jobs.toggle_pause();
                        (paused, jobs.processing)
                    };
                    self.persist().await;
                    tracing::info!(paused, "pause toggled");
                    if !paused && processing {
                        self.walk().await;
                    }
                }
                RunnerCommand::Cancel => {
                    self.cancel().await;
                }
            }
        }
    }

    async fn cancel(&mut self) {
        {
            let mut jobs = self.jobs.write().await;
            jobs.cancel();
        }
        self.driver.reset();
        self.persist().await;
        tracing::info!("run cancelled");
    }

    /// Walk the queue until it drains, the run is cancelled, or a manual
    /// pause hands control back to the command loop.
    async fn walk(&mut self) {
        loop {
            if !self.drain_commands().await {
                return;
            }

            // Flags and the cursor slot are read under one lock; the queue
            // can shrink while the walk is live, so the slot is re-checked
            // every pass instead of trusting a stale length.
            let (cursor, total, slot) = {
                let jobs = self.jobs.read().await;
                if !jobs.processing || jobs.paused {
                    return;
                }
                let slot = jobs
                    .items
                    .get(jobs.cursor)
                    .map(|item| (item.id, item.name.clone()));
                (jobs.cursor, jobs.items.len(), slot)
            };

            let Some((id, name)) = slot else {
                let stats = {
                    let mut jobs = self.jobs.write().await;
                    jobs.finish_run();
                    jobs.stats
                };
                self.persist().await;
                metrics::gauge!("batch_queue_depth").set(0.0);
                tracing::info!(
                    completed = stats.completed,
                    failed = stats.failed,
                    "queue drained, run finished"
                );
                return;
            };

            metrics::gauge!("batch_queue_depth").set((total - cursor) as f64);

            // Payload missing from the store: fail the item and move on.
            let payload = match self.store.get(id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(index = cursor, %id, error = %e, "payload missing from store");
                    self.apply(cursor, false).await;
                    continue;
                }
            };

            let dispatched = DispatchedItem {
                index: cursor,
                name: name.clone(),
                payload,
                prompt: self.options.prompt_for(cursor).map(str::to_string),
            };

            {
                let mut jobs = self.jobs.write().await;
                jobs.mark_dispatched(cursor);
            }
            self.persist().await;
            tracing::info!(index = cursor, name = %name, "dispatching item");

            let started = std::time::Instant::now();
            let verdict = drive_with_watchdog(
                self.driver.as_mut(),
                &mut self.rx,
                &self.jobs,
                &self.state_store,
                self.watchdog,
                &dispatched,
            )
            .await;

            let result = match verdict {
                ItemVerdict::Cancelled => {
                    self.cancel().await;
                    return;
                }
                ItemVerdict::Done(result) => result,
            };
            metrics::histogram!("batch_item_seconds").record(started.elapsed().as_secs_f64());

            let success = match result {
                Ok(outcome) => self.finish_download(cursor, &name, &outcome).await,
                Err(e) => {
                    tracing::warn!(index = cursor, name = %name, error = %e, "item failed");
                    false
                }
            };

            if !self.apply(cursor, success).await {
                return;
            }
        }
    }

    /// Apply a completion and run the follow-up action. Returns false when
    /// the walk must stop (cancel during a periodic pause).
    async fn apply(&mut self, index: usize, success: bool) -> bool {
        let completion = {
            let mut jobs = self.jobs.write().await;
            jobs.apply_completion(Some(index), success, &self.options)
        };
        self.persist().await;

        // Counters track applied completions only, mirroring RunStats.
        if let Completion::Applied(_) = completion {
            if success {
                metrics::counter!("batch_items_completed").increment(1);
            } else {
                metrics::counter!("batch_items_failed").increment(1);
            }
        }

        match completion {
            Completion::Applied(NextAction::Pause { duration_secs }) => {
                self.periodic_pause(Duration::from_secs(duration_secs)).await
            }
            Completion::Applied(NextAction::Continue) => {
                tokio::time::sleep(ITEM_DELAY).await;
                true
            }
            Completion::DuplicateDropped => {
                tracing::warn!(index, "duplicate completion dropped");
                true
            }
            Completion::UnknownIndex => {
                tracing::warn!(index, "completion for unknown index ignored");
                true
            }
        }
    }

    /// Dedup check, fetch, and write of the final video. Returns the success
    /// flag for the item.
    async fn finish_download(&mut self, index: usize, name: &str, outcome: &ItemOutcome) -> bool {
        let already = {
            let jobs = self.jobs.read().await;
            jobs.downloaded_urls.contains(&outcome.video_url)
        };
        if already {
            tracing::info!(index, url = %outcome.video_url, "result already downloaded, skipping");
            return true;
        }

        let bytes = match self.driver.fetch_video(&outcome.video_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(index, error = %e, "failed to fetch result video");
                return false;
            }
        };

        match self.downloader.save(name, &bytes).await {
            Ok(path) => {
                {
                    let mut jobs = self.jobs.write().await;
                    jobs.record_download(&outcome.video_url);
                }
                tracing::info!(index, path = %path.display(), "video saved");
                true
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "failed to write result video");
                false
            }
        }
    }

    /// Timed pause between items. Cancel aborts the run, TogglePause lifts
    /// the pause early. Returns false when the walk must stop.
    async fn periodic_pause(&mut self, duration: Duration) -> bool {
        let completed = {
            let mut jobs = self.jobs.write().await;
            jobs.begin_pause(duration.as_secs());
            jobs.stats.completed
        };
        self.persist().await;
        tracing::info!(completed, secs = duration.as_secs(), "periodic pause started");

        let rx = &mut self.rx;
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        let keep_walking = loop {
            tokio::select! {
                _ = &mut sleep => break true,
                command = rx.recv() => match command {
                    Some(RunnerCommand::Cancel) | None => break false,
                    Some(RunnerCommand::TogglePause) => {
                        tracing::info!("periodic pause lifted early");
                        break true;
                    }
                    Some(RunnerCommand::Start(_)) => {
                        tracing::warn!("start ignored: a run is already active");
                    }
                },
            }
        };

        if !keep_walking {
            self.cancel().await;
            return false;
        }

        {
            let mut jobs = self.jobs.write().await;
            jobs.end_pause();
        }
        self.persist().await;
        tracing::info!("periodic pause over, resuming");
        true
    }

    /// Handle commands that arrived between items without blocking. Returns
    /// false when the walk must stop.
    async fn drain_commands(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(RunnerCommand::Cancel) => {
                    self.cancel().await;
                    return false;
                }
                Ok(RunnerCommand::TogglePause) => {
                    let paused = {
                        let mut jobs = self.jobs.write().await;
                        jobs.toggle_pause()
                    };
                    self.persist().await;
                    tracing::info!(paused, "pause toggled");
                }
                Ok(RunnerCommand::Start(_)) => {
                    tracing::warn!("start ignored: a run is already active");
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    async fn persist(&self) {
        persist(&self.state_store, &self.jobs).await;
    }
}

/// Run the driver for one item under the watchdog. On expiry the session is
/// discarded and the same item retried without advancing the cursor; the
/// watchdog re-arms for every retry. Cancel tears down the in-flight work.
async fn drive_with_watchdog(
    driver: &mut dyn PageDriver,
    rx: &mut mpsc::Receiver<RunnerCommand>,
    jobs: &Arc<RwLock<JobState>>,
    state_store: &StateStore,
    watchdog: Duration,
    dispatched: &DispatchedItem,
) -> ItemVerdict {
    loop {
        let result = {
            let work = tokio::time::timeout(watchdog, driver.process(dispatched));
            tokio::pin!(work);

            loop {
                tokio::select! {
                    result = &mut work => break Some(result),
                    command = rx.recv() => match command {
                        Some(RunnerCommand::Cancel) | None => break None,
                        Some(RunnerCommand::TogglePause) => {
                            // Takes effect between items; the in-flight item
                            // keeps running.
                            let paused = {
                                let mut state = jobs.write().await;
                                state.toggle_pause()
                            };
                            persist(state_store, jobs).await;
                            tracing::info!(paused, "pause toggled while an item is in flight");
                        }
                        Some(RunnerCommand::Start(_)) => {
                            tracing::warn!("start ignored: a run is already active");
                        }
                    },
                }
            }
        };

        match result {
            None => {
                driver.reset();
                return ItemVerdict::Cancelled;
            }
            Some(Ok(done)) => return ItemVerdict::Done(done),
            Some(Err(_elapsed)) => {
                {
                    let mut state = jobs.write().await;
                    state.mark_stuck();
                }
                persist(state_store, jobs).await;
                tracing::warn!(
                    index = dispatched.index,
                    "watchdog expired, restarting item with a fresh session"
                );
                driver.reset();
                {
                    let mut state = jobs.write().await;
                    state.mark_dispatched(dispatched.index);
                }
                persist(state_store, jobs).await;
            }
        }
    }
}

/// Snapshot the shared state and write it through; persistence failures are
/// logged and the walk carries on with the in-memory record.
async fn persist(state_store: &StateStore, jobs: &Arc<RwLock<JobState>>) {
    let snapshot = {
        let jobs = jobs.read().await;
        jobs.clone()
    };
    if let Err(e) = state_store.save(&snapshot).await {
        tracing::warn!(error = %e, "failed to persist job state");
    }
}
