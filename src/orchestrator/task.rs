//! Migration task lifecycle: submission, status polling and teardown.
//!
//! A controller observes at most one task at a time. Polling runs on a
//! spawned timer task whose handle the controller owns; dropping the
//! controller (or calling [`TaskController::shutdown`]) aborts it together
//! with any poll requests still in flight.

use crate::api::{HttpError, MigrationService};
use crate::model::{ConsoleEvent, StopPolicy, TaskId, TaskSnapshot, TaskStatus};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// Snapshot cell shared between the controller and its poller.
type SharedSnapshot = Arc<Mutex<TaskSnapshot>>;

fn lock(state: &Mutex<TaskSnapshot>) -> MutexGuard<'_, TaskSnapshot> {
    // A poisoned lock still holds a complete snapshot.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Error)]
#[error("failed to start migration task: {source}")]
pub struct TaskStartFailed {
    #[source]
    pub source: HttpError,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub stop_policy: StopPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            stop_policy: StopPolicy::CompletedOnly,
        }
    }
}

/// Owned handle to the polling timer. Aborting it also drops the `JoinSet`
/// of in-flight polls, which aborts those too.
struct Poller {
    task_id: TaskId,
    handle: JoinHandle<()>,
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TaskController {
    service: Arc<dyn MigrationService>,
    settings: PollSettings,
    state: SharedSnapshot,
    events: Option<UnboundedSender<ConsoleEvent>>,
    poller: Option<Poller>,
}

impl TaskController {
    pub fn new(
        service: Arc<dyn MigrationService>,
        settings: PollSettings,
        events: Option<UnboundedSender<ConsoleEvent>>,
    ) -> Self {
        Self {
            service,
            settings,
            state: Arc::new(Mutex::new(TaskSnapshot::default())),
            events,
            poller: None,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        lock(&self.state).clone()
    }

    /// Whether the polling timer is still alive.
    pub fn is_polling(&self) -> bool {
        self.poller
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Submit a new migration task and start polling it.
    ///
    /// Any task observed so far is discarded first. On failure the status
    /// becomes `error` and no timer is created.
    pub async fn start(&mut self) -> Result<TaskId, TaskStartFailed> {
        self.stop_polling();

        match self.service.start_migration().await {
            Ok(task_id) => {
                info!(%task_id, "migration task started");
                self.begin(task_id.clone(), TaskStatus::Running);
                emit(
                    &self.events,
                    ConsoleEvent::TaskStarted {
                        task_id: task_id.clone(),
                    },
                );
                Ok(task_id)
            }
            Err(source) => {
                warn!(error = %source, "migration task failed to start");
                let snapshot = TaskSnapshot {
                    task_id: None,
                    status: TaskStatus::Error,
                    progress: None,
                };
                *lock(&self.state) = snapshot.clone();
                emit(
                    &self.events,
                    ConsoleEvent::TaskStartFailed {
                        message: source.to_string(),
                    },
                );
                emit(&self.events, ConsoleEvent::TaskUpdated { snapshot });
                Err(TaskStartFailed { source })
            }
        }
    }

    /// Observe a task that was started elsewhere. Its status stays `idle`
    /// until the first poll answers.
    pub fn watch(&mut self, task_id: TaskId) {
        self.stop_polling();
        info!(%task_id, "watching existing migration task");
        self.begin(task_id, TaskStatus::Idle);
    }

    /// Cancel the polling timer. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.stop_polling();
    }

    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            debug!(task_id = %poller.task_id, "polling cancelled");
        }
    }

    fn begin(&mut self, task_id: TaskId, status: TaskStatus) {
        let snapshot = TaskSnapshot {
            task_id: Some(task_id.clone()),
            status,
            progress: None,
        };
        *lock(&self.state) = snapshot.clone();
        emit(&self.events, ConsoleEvent::TaskUpdated { snapshot });

        let ctx = PollContext {
            service: self.service.clone(),
            task_id: task_id.clone(),
            settings: self.settings,
            state: self.state.clone(),
            events: self.events.clone(),
        };
        self.poller = Some(Poller {
            task_id,
            handle: tokio::spawn(poll_task(ctx)),
        });
    }
}

impl Drop for TaskController {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

fn emit(events: &Option<UnboundedSender<ConsoleEvent>>, ev: ConsoleEvent) {
    if let Some(tx) = events {
        // Receiver gone means nobody is displaying events anymore.
        let _ = tx.send(ev);
    }
}

struct PollContext {
    service: Arc<dyn MigrationService>,
    task_id: TaskId,
    settings: PollSettings,
    state: SharedSnapshot,
    events: Option<UnboundedSender<ConsoleEvent>>,
}

/// Poll the task's status every interval until a terminal status is applied.
///
/// Each tick issues its request independently, so a slow response never
/// delays the next tick. Requests are numbered; a response older than the
/// last one applied is dropped instead of overwriting newer state. Failed
/// polls are skipped and the timer keeps running. Once the snapshot cell
/// belongs to another task the poller exits without writing to it.
async fn poll_task(ctx: PollContext) {
    let PollContext {
        service,
        task_id,
        settings,
        state,
        events,
    } = ctx;

    // First poll fires one full interval after the task is known.
    let mut ticker = tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut in_flight: JoinSet<(u64, Result<crate::model::StatusResponse, HttpError>)> =
        JoinSet::new();
    let mut issued = 0u64;
    let mut applied = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                issued += 1;
                let seq = issued;
                let service = service.clone();
                let id = task_id.clone();
                debug!(task_id = %id, seq, "polling task status");
                in_flight.spawn(async move {
                    let res = service.migration_status(&id).await;
                    (seq, res)
                });
            }
            Some(joined) = in_flight.join_next() => {
                let (seq, res) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "status poll task failed");
                        continue;
                    }
                };
                let resp = match res {
                    Ok(resp) => resp,
                    Err(e) => {
                        debug!(task_id = %task_id, seq, error = %e, "status poll skipped");
                        emit(&events, ConsoleEvent::PollSkipped {
                            task_id: task_id.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                if seq <= applied {
                    debug!(task_id = %task_id, seq, applied, "dropping stale status response");
                    continue;
                }
                applied = seq;

                let status = resp.status;
                let progress = resp.progress();
                let applied_snapshot = {
                    let mut snap = lock(&state);
                    if snap.task_id.as_ref() == Some(&task_id) {
                        snap.status = status;
                        if progress.is_some() {
                            snap.progress = progress;
                        }
                        Some(snap.clone())
                    } else {
                        None
                    }
                };
                let Some(snapshot) = applied_snapshot else {
                    debug!(task_id = %task_id, seq, "task no longer observed, poller exiting");
                    break;
                };
                debug!(task_id = %task_id, seq, %status, "status applied");
                emit(&events, ConsoleEvent::TaskUpdated { snapshot });

                if settings.stop_policy.is_terminal(status) {
                    info!(task_id = %task_id, %status, "task reached terminal status, polling stopped");
                    emit(&events, ConsoleEvent::PollingStopped {
                        task_id: task_id.clone(),
                        status,
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversionResult, ProgressSnapshot, StatusResponse};
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    enum Reply {
        Status(StatusResponse),
        Delayed(Duration, StatusResponse),
        Fail,
    }

    fn status(status: TaskStatus) -> StatusResponse {
        StatusResponse {
            status,
            tables: None,
            rows: None,
            sprocs: None,
        }
    }

    fn with_rows(status: TaskStatus, rows: u64) -> StatusResponse {
        StatusResponse {
            status,
            tables: Some(1),
            rows: Some(rows),
            sprocs: Some(0),
        }
    }

    /// Service double that replays scripted poll replies, then keeps
    /// answering `running`.
    struct Scripted {
        start_ok: bool,
        replies: Mutex<VecDeque<Reply>>,
        polls: AtomicUsize,
        polled_ids: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(start_ok: bool, replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                start_ok,
                replies: Mutex::new(replies.into()),
                polls: AtomicUsize::new(0),
                polled_ids: Mutex::new(Vec::new()),
            })
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl MigrationService for Scripted {
        async fn start_migration(&self) -> Result<TaskId, HttpError> {
            if self.start_ok {
                Ok(TaskId::new("T1"))
            } else {
                Err(HttpError::status(StatusCode::INTERNAL_SERVER_ERROR, "boom"))
            }
        }

        async fn migration_status(&self, task_id: &TaskId) -> Result<StatusResponse, HttpError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.polled_ids
                .lock()
                .unwrap()
                .push(format!("/api/migration/status/{task_id}"));
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Status(r)) => Ok(r),
                Some(Reply::Delayed(d, r)) => {
                    sleep(d).await;
                    Ok(r)
                }
                Some(Reply::Fail) => Err(HttpError::status(StatusCode::BAD_GATEWAY, "")),
                None => Ok(status(TaskStatus::Running)),
            }
        }

        async fn convert_sql(&self, _sql: &str) -> Result<ConversionResult, HttpError> {
            unreachable!("not used by task controller")
        }
    }

    fn controller(service: Arc<Scripted>, stop_policy: StopPolicy) -> TaskController {
        TaskController::new(
            service,
            PollSettings {
                interval: DEFAULT_POLL_INTERVAL,
                stop_policy,
            },
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_enters_running_and_polls_task_endpoint() {
        let svc = Scripted::new(true, vec![]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        assert_eq!(ctl.snapshot().status, TaskStatus::Idle);

        let id = ctl.start().await.unwrap();
        assert_eq!(id, TaskId::new("T1"));
        assert_eq!(ctl.snapshot().status, TaskStatus::Running);
        assert!(ctl.is_polling());

        // nothing before the first interval elapses
        sleep(Duration::from_millis(4900)).await;
        assert_eq!(svc.polls(), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(svc.polls(), 1);
        assert_eq!(
            svc.polled_ids.lock().unwrap().as_slice(),
            ["/api/migration/status/T1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_sets_error_and_never_polls() {
        let svc = Scripted::new(false, vec![]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);

        assert!(ctl.start().await.is_err());
        assert_eq!(ctl.snapshot().status, TaskStatus::Error);
        assert!(!ctl.is_polling());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(svc.polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_stops_polling_for_good() {
        let svc = Scripted::new(
            true,
            vec![
                Reply::Status(with_rows(TaskStatus::Running, 10)),
                Reply::Status(with_rows(TaskStatus::Running, 20)),
                Reply::Status(with_rows(TaskStatus::Completed, 30)),
            ],
        );
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(10_100)).await;
        assert_eq!(svc.polls(), 2);
        assert_eq!(ctl.snapshot().progress.unwrap().rows, 20);
        assert!(ctl.is_polling());

        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(svc.polls(), 3);
        assert_eq!(ctl.snapshot().status, TaskStatus::Completed);
        assert_eq!(ctl.snapshot().progress.unwrap().rows, 30);
        assert!(!ctl.is_polling());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(svc.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_keeps_polling_by_default() {
        let svc = Scripted::new(true, vec![Reply::Status(status(TaskStatus::Error))]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(ctl.snapshot().status, TaskStatus::Error);
        assert!(ctl.is_polling());

        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(svc.polls(), 2);
        assert_eq!(ctl.snapshot().status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_stops_polling_when_configured() {
        let svc = Scripted::new(true, vec![Reply::Status(status(TaskStatus::Error))]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOrError);
        ctl.start().await.unwrap();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(svc.polls(), 1);
        assert_eq!(ctl.snapshot().status, TaskStatus::Error);
        assert!(!ctl.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_skipped_and_retried() {
        let svc = Scripted::new(
            true,
            vec![
                Reply::Status(with_rows(TaskStatus::Running, 5)),
                Reply::Fail,
                Reply::Status(with_rows(TaskStatus::Running, 7)),
            ],
        );
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(10_100)).await;
        assert_eq!(svc.polls(), 2);
        // the failed tick left the previous snapshot untouched
        assert_eq!(ctl.snapshot().status, TaskStatus::Running);
        assert_eq!(ctl.snapshot().progress.unwrap().rows, 5);
        assert!(ctl.is_polling());

        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(ctl.snapshot().progress.unwrap().rows, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_response_does_not_overwrite_newer_one() {
        let svc = Scripted::new(
            true,
            vec![
                // issued at 5s, lands at 12s
                Reply::Delayed(Duration::from_secs(7), with_rows(TaskStatus::Running, 10)),
                // issued at 10s, lands at once
                Reply::Status(with_rows(TaskStatus::Running, 20)),
            ],
        );
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(10_100)).await;
        assert_eq!(ctl.snapshot().progress.unwrap().rows, 20);

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(ctl.snapshot().progress.unwrap().rows, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_kept_when_response_has_no_counts() {
        let svc = Scripted::new(
            true,
            vec![
                Reply::Status(with_rows(TaskStatus::Running, 9)),
                Reply::Status(status(TaskStatus::Running)),
            ],
        );
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(10_100)).await;
        assert_eq!(
            ctl.snapshot().progress,
            Some(ProgressSnapshot {
                tables: 1,
                rows: 9,
                sprocs: 0
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_further_polls() {
        let svc = Scripted::new(true, vec![]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(svc.polls(), 1);

        ctl.shutdown();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(svc.polls(), 1);
        assert!(!ctl.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_controller_stops_polls_and_ignores_late_responses() {
        let svc = Scripted::new(
            true,
            vec![Reply::Delayed(
                Duration::from_secs(3),
                with_rows(TaskStatus::Running, 1),
            )],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctl = TaskController::new(svc.clone(), PollSettings::default(), Some(tx));
        ctl.start().await.unwrap();

        // first poll is in flight when the controller goes away
        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(svc.polls(), 1);
        drop(ctl);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(svc.polls(), 1);

        let mut updates_with_progress = 0;
        while let Ok(ev) = rx.try_recv() {
            if let ConsoleEvent::TaskUpdated { snapshot } = ev {
                if snapshot.progress.is_some() {
                    updates_with_progress += 1;
                }
            }
        }
        assert_eq!(updates_with_progress, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_discards_previous_task() {
        let svc = Scripted::new(true, vec![Reply::Status(with_rows(TaskStatus::Running, 4))]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.start().await.unwrap();
        sleep(Duration::from_millis(5_100)).await;
        assert!(ctl.snapshot().progress.is_some());

        ctl.start().await.unwrap();
        let snap = ctl.snapshot();
        assert_eq!(snap.status, TaskStatus::Running);
        assert_eq!(snap.progress, None);

        // only the new timer is running: one poll per interval
        let before = svc.polls();
        sleep(Duration::from_millis(5_050)).await;
        assert_eq!(svc.polls(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_attaches_to_existing_task() {
        let svc = Scripted::new(true, vec![Reply::Status(status(TaskStatus::Completed))]);
        let mut ctl = controller(svc.clone(), StopPolicy::CompletedOnly);
        ctl.watch(TaskId::new("42"));
        assert_eq!(ctl.snapshot().status, TaskStatus::Idle);
        assert_eq!(ctl.snapshot().task_id, Some(TaskId::new("42")));

        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(ctl.snapshot().status, TaskStatus::Completed);
        assert!(!ctl.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_poller_leaves_new_task_snapshot_alone() {
        let svc = Scripted::new(true, vec![Reply::Status(with_rows(TaskStatus::Completed, 99))]);
        let current = TaskSnapshot {
            task_id: Some(TaskId::new("T2")),
            status: TaskStatus::Idle,
            progress: None,
        };
        let state: SharedSnapshot = Arc::new(Mutex::new(current.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // a poller for T1 still alive after the cell was handed to T2
        let handle = tokio::spawn(poll_task(PollContext {
            service: svc.clone(),
            task_id: TaskId::new("T1"),
            settings: PollSettings::default(),
            state: state.clone(),
            events: Some(tx),
        }));

        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(svc.polls(), 1);
        assert!(handle.is_finished());
        assert_eq!(*lock(&state), current);
        assert!(rx.try_recv().is_err());
    }
}
