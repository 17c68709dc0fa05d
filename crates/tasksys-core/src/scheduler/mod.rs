//! Scheduler - トリガーに従ってタスクを Queue へ投入する
//!
//! # 設計
//! - ジョブはライブのタスクを保持しない。保存するのは `SerializedTask` のみで、
//!   発火のたびに [`TaskRegistry`] で復元してから Queue に渡す
//! - ジョブ 1 件につき tokio のタイマータスク 1 本。削除・置換・shutdown で abort する
//! - ジョブ一覧は変更のたびに `scheduledJobs` キーへ書き出す
//!
//! # 再発火の抑止
//! 定期ジョブの前回分（同じ task id）がまだ pending / running なら、その回はスキップする。

mod job;
mod trigger;

pub use self::job::{ScheduledJob, ScheduledJobInfo};
pub use self::trigger::Trigger;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{JobId, TaskEvent, TaskSystemError};
use crate::impls::EventBus;
use crate::ports::{Clock, KvStore};
use crate::queue::TaskQueue;
use crate::sync::lock;
use crate::task::TaskHandle;
use crate::typed::TaskRegistry;

pub const SCHEDULED_JOBS_KEY: &str = "scheduledJobs";

struct JobSlot {
    job: ScheduledJob,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobSlot>,
    shut_down: bool,
}

/// Cheap to clone; all clones share the same job table.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    queue: TaskQueue,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn KvStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    runtime: Handle,
}

impl TaskScheduler {
    pub fn new(
        queue: TaskQueue,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn KvStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState::default()),
                queue,
                registry,
                store,
                bus,
                clock,
                runtime,
            }),
        }
    }

    /// Register a job for `task`. Scheduling the same task again replaces its job.
    pub fn add_scheduled_task(&self, task: &TaskHandle, trigger: Trigger) -> Result<JobId, TaskSystemError> {
        let shared = &self.shared;
        let now = shared.clock.now();
        trigger.validate(now)?;
        // Chain children are restored by type at fire time too.
        if let Some(task_type) = shared.registry.first_unregistered(task) {
            return Err(TaskSystemError::UnknownTaskType(task_type));
        }

        let snapshot = task.serialize()?;
        let job = ScheduledJob {
            job_id: JobId::for_task(task.id()),
            task_id: task.id(),
            task_type: snapshot.task_type.clone(),
            task_name: snapshot.name.clone(),
            next_run: trigger.first_run(now),
            trigger,
            created_at: now,
            task: snapshot,
        };
        let job_id = job.job_id;

        {
            let mut state = lock(&shared.state);
            if state.shut_down {
                return Err(TaskSystemError::ShutDown);
            }
            if let Some(previous) = state.jobs.remove(&job_id) {
                debug!(job_id = %job_id, "replacing existing job");
                abort(previous.timer);
            }
            let timer = shared.arm(job_id, job.next_run);
            state.jobs.insert(job_id, JobSlot { job, timer: Some(timer) });
        }

        shared.persist();
        info!(job_id = %job_id, task_id = %task.id(), task_type = task.type_name(), "job scheduled");
        shared.bus.publish(TaskEvent::JobScheduled {
            job_id,
            task_id: task.id(),
        });
        Ok(job_id)
    }

    pub fn remove_scheduled_task(&self, job_id: JobId) -> Result<(), TaskSystemError> {
        let slot = lock(&self.shared.state).jobs.remove(&job_id);
        let Some(slot) = slot else {
            return Err(TaskSystemError::JobNotFound(job_id));
        };
        abort(slot.timer);
        self.shared.persist();
        info!(job_id = %job_id, "job unscheduled");
        self.shared.bus.publish(TaskEvent::JobUnscheduled { job_id });
        Ok(())
    }

    /// Current jobs, soonest first.
    pub fn get_scheduled_jobs(&self) -> Vec<ScheduledJobInfo> {
        let mut jobs: Vec<ScheduledJobInfo> = lock(&self.shared.state)
            .jobs
            .values()
            .map(|slot| ScheduledJobInfo::from(&slot.job))
            .collect();
        jobs.sort_by(|a, b| a.next_run.cmp(&b.next_run).then(a.job_id.cmp(&b.job_id)));
        jobs
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        lock(&self.shared.state).jobs.contains_key(&job_id)
    }

    /// Fire a job now, outside its timer.
    pub fn run_job_now(&self, job_id: JobId) -> Result<(), TaskSystemError> {
        if !self.contains(job_id) {
            return Err(TaskSystemError::JobNotFound(job_id));
        }
        self.shared.fire(job_id);
        Ok(())
    }

    pub fn save_state(&self) -> Result<(), TaskSystemError> {
        self.shared.save_state()
    }

    /// Re-install persisted jobs and arm their timers.
    ///
    /// - date jobs already in the past are dropped
    /// - interval jobs that missed their run fire one interval from now
    /// - cron jobs are recomputed from now
    pub fn load_state(&self) -> Result<usize, TaskSystemError> {
        let shared = &self.shared;
        let records = match shared.store.get(SCHEDULED_JOBS_KEY)? {
            None => return Ok(0),
            Some(Value::Array(records)) => records,
            Some(_) => {
                warn!(key = SCHEDULED_JOBS_KEY, "ignoring malformed job list");
                return Ok(0);
            }
        };

        let now = shared.clock.now();
        let mut restored = 0;
        {
            let mut state = lock(&shared.state);
            for value in records {
                let mut job: ScheduledJob = match serde_json::from_value(value) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable job");
                        continue;
                    }
                };
                if !shared.registry.contains(&job.task_type) {
                    warn!(job_id = %job.job_id, task_type = %job.task_type, "skipping job of unregistered type");
                    continue;
                }
                match job.trigger {
                    Trigger::Date { run_at } if run_at <= now => {
                        info!(job_id = %job.job_id, run_at = %run_at, "dropping expired one-off job");
                        continue;
                    }
                    Trigger::Date { .. } => {}
                    Trigger::Interval { .. } => {
                        if job.next_run <= now {
                            job.next_run = job.trigger.first_run(now);
                        }
                    }
                    Trigger::Cron { .. } => job.next_run = job.trigger.first_run(now),
                }

                let job_id = job.job_id;
                if let Some(previous) = state.jobs.remove(&job_id) {
                    abort(previous.timer);
                }
                let timer = shared.arm(job_id, job.next_run);
                state.jobs.insert(job_id, JobSlot { job, timer: Some(timer) });
                restored += 1;
            }
        }
        shared.persist();
        info!(restored, "scheduled jobs restored");
        Ok(restored)
    }

    /// Abort every timer. Jobs stay persisted for the next start.
    pub fn shutdown(&self) {
        let mut state = lock(&self.shared.state);
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for slot in state.jobs.values_mut() {
            abort(slot.timer.take());
        }
        info!(jobs = state.jobs.len(), "scheduler shut down");
    }
}

impl SchedulerShared {
    /// Spawn the timer for one job. Caller holds the state lock and stores the handle.
    fn arm(self: &Arc<Self>, job_id: JobId, next_run: chrono::DateTime<chrono::Utc>) -> JoinHandle<()> {
        let delay = (next_run - self.clock.now()).to_std().unwrap_or_default();
        let weak: Weak<Self> = Arc::downgrade(self);
        debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "job timer armed");
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire(job_id);
            }
        })
    }

    fn fire(self: &Arc<Self>, job_id: JobId) {
        let job = match lock(&self.state).jobs.get(&job_id) {
            Some(slot) => slot.job.clone(),
            None => return,
        };

        if self.queue.contains(job.task_id) {
            warn!(job_id = %job_id, task_id = %job.task_id, "previous run still active, skipping this firing");
        } else {
            match self
                .registry
                .deserialize(&job.task)
                .and_then(|task| self.queue.add_task(task))
            {
                Ok(()) => {
                    info!(job_id = %job_id, task_id = %job.task_id, trigger = %job.trigger, "job fired");
                    self.bus.publish(TaskEvent::JobExecuted {
                        job_id,
                        task_id: job.task_id,
                    });
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "job fired but the task was not queued"),
            }
        }

        let now = self.clock.now();
        let unscheduled = {
            let mut state = lock(&self.state);
            if state.shut_down {
                return;
            }
            match job.trigger.next_after(now) {
                None => state.jobs.remove(&job_id).is_some(),
                Some(next_run) => {
                    let timer = self.arm(job_id, next_run);
                    if let Some(slot) = state.jobs.get_mut(&job_id) {
                        slot.job.next_run = next_run;
                        // The old handle may be this very timer; detach it instead of aborting.
                        slot.timer = Some(timer);
                    } else {
                        timer.abort();
                    }
                    false
                }
            }
        };

        self.persist();
        if unscheduled {
            debug!(job_id = %job_id, "one-off job completed");
            self.bus.publish(TaskEvent::JobUnscheduled { job_id });
        }
    }

    fn save_state(&self) -> Result<(), TaskSystemError> {
        let jobs: Vec<ScheduledJob> = lock(&self.state)
            .jobs
            .values()
            .map(|slot| slot.job.clone())
            .collect();
        let mut records = Vec::with_capacity(jobs.len());
        for job in &jobs {
            records.push(serde_json::to_value(job)?);
        }
        self.store.set(SCHEDULED_JOBS_KEY, Value::Array(records))?;
        self.store.flush()?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to persist scheduled jobs");
        }
    }
}

fn abort(timer: Option<JoinHandle<()>>) {
    if let Some(timer) = timer {
        timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::Task;
    use crate::domain::{EventKind, TaskStatus};
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, SystemClock};
    use crate::queue::QueueOptions;
    use crate::task::TaskOptions;
    use crate::chain::{ChainPolicy, TaskChain};
    use crate::testing::{EchoTask, FailingTask, SleepyTask};
    use crate::tracker::{HistoryLimits, Tracker};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Fixture {
        scheduler: TaskScheduler,
        queue: TaskQueue,
        tracker: Arc<Tracker>,
        bus: EventBus,
        store: Arc<InMemoryStore>,
    }

    fn fixture(store: Arc<InMemoryStore>, clock: Arc<dyn Clock>) -> Fixture {
        let bus = EventBus::new();
        let tracker = Arc::new(Tracker::new(store.clone(), bus.clone(), HistoryLimits::default()));
        let queue = TaskQueue::new(
            Arc::clone(&tracker),
            bus.clone(),
            store.clone(),
            Handle::current(),
            QueueOptions::default(),
        );
        let mut registry = TaskRegistry::new();
        registry.register::<EchoTask>().unwrap();
        registry.register::<SleepyTask>().unwrap();
        let scheduler = TaskScheduler::new(
            queue.clone(),
            Arc::new(registry),
            store.clone(),
            bus.clone(),
            clock,
            Handle::current(),
        );
        Fixture {
            scheduler,
            queue,
            tracker,
            bus,
            store,
        }
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, 9, 0, 0).unwrap()
    }

    fn fixed(store: Arc<InMemoryStore>) -> (Fixture, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(start()));
        (fixture(store, clock.clone()), clock)
    }

    fn counter(bus: &EventBus, kind: EventKind) -> Arc<AtomicU32> {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(Some(kind), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn schedules_lists_and_persists_jobs() {
        let (f, _clock) = fixed(Arc::new(InMemoryStore::new()));
        let scheduled = counter(&f.bus, EventKind::JobScheduled);
        let task = TaskHandle::with_options(EchoTask { value: 3 }, TaskOptions::named("nightly"));

        let job_id = f.scheduler.add_scheduled_task(&task, Trigger::interval(60)).unwrap();
        assert_eq!(job_id, JobId::for_task(task.id()));

        let jobs = f.scheduler.get_scheduled_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_name, "nightly");
        assert_eq!(jobs[0].task_type, EchoTask::TYPE);
        assert_eq!(jobs[0].next_run, start() + ChronoDuration::seconds(60));
        assert_eq!(scheduled.load(Ordering::SeqCst), 1);

        let saved = f.store.get(SCHEDULED_JOBS_KEY).unwrap().unwrap();
        assert_eq!(saved[0]["task"]["type"], EchoTask::TYPE);
        assert_eq!(saved[0]["trigger"]["type"], "interval");
        // The live task is not queued until the trigger fires.
        assert!(!f.queue.contains(task.id()));
    }

    #[tokio::test]
    async fn rescheduling_a_task_replaces_its_job() {
        let (f, _clock) = fixed(Arc::new(InMemoryStore::new()));
        let task = TaskHandle::new(EchoTask { value: 1 });
        f.scheduler.add_scheduled_task(&task, Trigger::interval(60)).unwrap();
        f.scheduler.add_scheduled_task(&task, Trigger::daily(6, 0)).unwrap();

        let jobs = f.scheduler.get_scheduled_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger, Trigger::daily(6, 0));
    }

    #[tokio::test]
    async fn invalid_trigger_is_rejected_before_anything_is_stored() {
        let (f, _clock) = fixed(Arc::new(InMemoryStore::new()));
        let task = TaskHandle::new(EchoTask { value: 1 });
        let err = f
            .scheduler
            .add_scheduled_task(&task, Trigger::date(start() - ChronoDuration::hours(1)))
            .unwrap_err();
        assert!(matches!(err, TaskSystemError::InvalidTrigger(_)));
        assert!(f.scheduler.get_scheduled_jobs().is_empty());
        assert_eq!(f.store.get(SCHEDULED_JOBS_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn chain_with_an_unregistered_child_is_rejected_up_front() {
        let (f, _clock) = fixed(Arc::new(InMemoryStore::new()));
        let chain = TaskChain::build(
            TaskOptions::named("nightly pipeline"),
            vec![TaskHandle::new(EchoTask { value: 1 }), TaskHandle::new(FailingTask::times(0))],
            ChainPolicy::new(),
        );
        assert!(matches!(
            f.scheduler.add_scheduled_task(&chain, Trigger::interval(60)),
            Err(TaskSystemError::UnknownTaskType(task_type)) if task_type == FailingTask::TYPE
        ));
        assert!(f.scheduler.get_scheduled_jobs().is_empty());

        let known = TaskChain::build(
            TaskOptions::named("known"),
            vec![TaskHandle::new(EchoTask { value: 1 })],
            ChainPolicy::new(),
        );
        f.scheduler.add_scheduled_task(&known, Trigger::interval(60)).unwrap();
    }

    #[tokio::test]
    async fn removing_an_unknown_job_fails() {
        let (f, _clock) = fixed(Arc::new(InMemoryStore::new()));
        let unscheduled = counter(&f.bus, EventKind::JobUnscheduled);
        let task = TaskHandle::new(EchoTask { value: 1 });
        let job_id = f.scheduler.add_scheduled_task(&task, Trigger::interval(60)).unwrap();

        f.scheduler.remove_scheduled_task(job_id).unwrap();
        assert!(matches!(
            f.scheduler.remove_scheduled_task(job_id),
            Err(TaskSystemError::JobNotFound(id)) if id == job_id
        ));
        assert_eq!(unscheduled.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.get(SCHEDULED_JOBS_KEY).unwrap(), Some(serde_json::json!([])));
    }

    #[tokio::test]
    async fn date_job_fires_once_and_is_removed() {
        let f = fixture(Arc::new(InMemoryStore::new()), Arc::new(SystemClock));
        let executed = counter(&f.bus, EventKind::JobExecuted);
        let task = TaskHandle::new(EchoTask { value: 11 });
        let run_at = Utc::now() + ChronoDuration::milliseconds(50);
        let job_id = f.scheduler.add_scheduled_task(&task, Trigger::date(run_at)).unwrap();

        timeout(Duration::from_secs(5), async {
            while f.scheduler.contains(job_id) || !f.queue.is_idle() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("date job did not fire");

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        // The submitted handle was never run; the queue ran a restored copy.
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(!f.tracker.contains(task.id()));
    }

    #[tokio::test]
    async fn recurring_job_skips_while_previous_run_is_active() {
        let (f, clock) = fixed(Arc::new(InMemoryStore::new()));
        let executed = counter(&f.bus, EventKind::JobExecuted);
        let task = TaskHandle::new(SleepyTask { steps: 500, step_ms: 2 });
        let job_id = f.scheduler.add_scheduled_task(&task, Trigger::interval(3600)).unwrap();

        f.scheduler.run_job_now(job_id).unwrap();
        assert!(f.queue.contains(task.id()));
        clock.advance(ChronoDuration::minutes(1));
        f.scheduler.run_job_now(job_id).unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.scheduler.get_scheduled_jobs()[0].next_run,
            start() + ChronoDuration::minutes(61)
        );

        f.queue.cancel_task(task.id());
        timeout(Duration::from_secs(5), async {
            while !f.queue.is_idle() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn reload_applies_missed_run_rules() {
        let store = Arc::new(InMemoryStore::new());
        let (first, clock) = fixed(Arc::clone(&store));
        let one_off = TaskHandle::new(EchoTask { value: 1 });
        let later = TaskHandle::new(EchoTask { value: 2 });
        let periodic = TaskHandle::new(EchoTask { value: 3 });
        let daily = TaskHandle::new(EchoTask { value: 4 });
        first
            .scheduler
            .add_scheduled_task(&one_off, Trigger::date(start() + ChronoDuration::minutes(5)))
            .unwrap();
        first
            .scheduler
            .add_scheduled_task(&later, Trigger::date(start() + ChronoDuration::days(2)))
            .unwrap();
        first.scheduler.add_scheduled_task(&periodic, Trigger::interval(600)).unwrap();
        first.scheduler.add_scheduled_task(&daily, Trigger::daily(7, 15)).unwrap();
        first.scheduler.shutdown();

        // Restart a day later: both the one-off and the interval run were missed.
        clock.advance(ChronoDuration::days(1));
        let second = fixture(store, clock.clone());
        assert_eq!(second.scheduler.load_state().unwrap(), 3);

        let jobs = second.scheduler.get_scheduled_jobs();
        let find = |task: &TaskHandle| jobs.iter().find(|job| job.task_id == task.id()).cloned();
        assert!(find(&one_off).is_none());
        assert_eq!(find(&later).unwrap().next_run, start() + ChronoDuration::days(2));
        assert_eq!(
            find(&periodic).unwrap().next_run,
            clock.now() + ChronoDuration::seconds(600)
        );
        assert_eq!(
            find(&daily).unwrap().next_run,
            Trigger::daily(7, 15).first_run(clock.now())
        );
        second.scheduler.shutdown();
    }

    #[tokio::test]
    async fn corrupt_job_records_are_skipped_on_reload() {
        let store = Arc::new(InMemoryStore::new());
        store
            .set(
                SCHEDULED_JOBS_KEY,
                serde_json::json!([{ "jobId": "not-a-job" }, 42]),
            )
            .unwrap();
        let (f, _clock) = fixed(store);
        assert_eq!(f.scheduler.load_state().unwrap(), 0);
        assert!(f.scheduler.get_scheduled_jobs().is_empty());
    }

    #[tokio::test]
    async fn shut_down_scheduler_refuses_new_jobs() {
        let (f, _clock) = fixed(Arc::new(InMemoryStore::new()));
        f.scheduler.shutdown();
        let task = TaskHandle::new(EchoTask { value: 1 });
        assert!(matches!(
            f.scheduler.add_scheduled_task(&task, Trigger::interval(5)),
            Err(TaskSystemError::ShutDown)
        ));
    }
}
