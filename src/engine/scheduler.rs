//! Scheduler and worker pool
//!
//! Each worker repeatedly takes a random task, acquires a random live proxy,
//! executes the body under a timeout and charges any failure to the task budget
//! and, for transport failures, to the proxy. Workers exit when the queue drains
//! or the engine is shut down.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::classifier::{DefaultClassifier, ErrorClassifier, FailureClass};
use crate::engine::queue::{
    Extraction, RequeueOutcome, TaskFactory, TaskLease, TaskQueue, DEFAULT_TASK_BUDGET,
};
use crate::engine::task::{TaskBody, TaskContext, TaskId, TaskOutcome};
use crate::error::{CrawlError, Result};
use crate::models::ProxyAddress;
use crate::proxy::{HttpSession, ProxyHealthPool, ReportOutcome};
use crate::sink::RecordSink;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Maximum tasks in flight at once
    pub max_in_flight: usize,
    /// Attempt budget of every new task
    pub initial_budget: f64,
    /// Fraction of the initial budget charged per transport failure
    pub transport_decay_factor: f64,
    /// Budget charged per logic failure
    pub logic_decay: f64,
    /// Upper bound on a single execution
    pub task_timeout: Duration,
    /// Pause of the failing worker after a failure
    pub failure_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            max_in_flight: 100,
            initial_budget: DEFAULT_TASK_BUDGET,
            // 0.1 per transport failure at the default budget, a tenth of a logic failure
            transport_decay_factor: 0.01,
            logic_decay: 1.0,
            task_timeout: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    /// Budget charged per transport failure
    pub fn transport_step(&self) -> f64 {
        self.transport_decay_factor * self.initial_budget
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CrawlError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(CrawlError::InvalidConfig(
                "max in-flight tasks must be at least 1".to_string(),
            ));
        }
        if !(self.initial_budget > 0.0) {
            return Err(CrawlError::InvalidConfig(format!(
                "initial task budget must be positive, got {}",
                self.initial_budget
            )));
        }
        // A zero charge would let a failing task retry forever
        if !(self.transport_step() > 0.0) || !(self.logic_decay > 0.0) {
            return Err(CrawlError::InvalidConfig(format!(
                "failure decay must be positive, got transport factor={} logic={}",
                self.transport_decay_factor, self.logic_decay
            )));
        }
        if self.task_timeout.is_zero() {
            return Err(CrawlError::InvalidConfig(
                "task timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub enqueued: u64,
    pub completed: u64,
    pub skipped: u64,
    pub abandoned: u64,
    /// Still pending when the run stopped (non-zero only after shutdown)
    pub unfinished: usize,
    pub transport_failures: u64,
    pub logic_failures: u64,
    pub evicted_proxies: u64,
    pub peak_in_flight: usize,
    pub crashed_workers: usize,
    pub elapsed_ms: u64,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} tasks completed ({} skipped, {} abandoned, {} unfinished); \
             {} transport and {} logic failures; {} proxies evicted; \
             peak in flight {}; finished in {:.1}s",
            self.completed + self.skipped,
            self.enqueued,
            self.skipped,
            self.abandoned,
            self.unfinished,
            self.transport_failures,
            self.logic_failures,
            self.evicted_proxies,
            self.peak_in_flight,
            self.elapsed_ms as f64 / 1000.0
        )
    }
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    skipped: AtomicU64,
    transport_failures: AtomicU64,
    logic_failures: AtomicU64,
    evicted_proxies: AtomicU64,
}

struct Shared {
    config: SchedulerConfig,
    queue: Arc<TaskQueue>,
    factory: TaskFactory,
    pool: Arc<ProxyHealthPool>,
    session: HttpSession,
    sink: Arc<dyn RecordSink>,
    classifier: Arc<dyn ErrorClassifier>,
    counters: Counters,
    shutdown: watch::Receiver<bool>,
}

enum Execution {
    Finished(Result<TaskOutcome>),
    Cancelled,
}

/// Runs tasks from the queue on a fixed set of workers
pub struct Scheduler {
    shared: Arc<Shared>,
    handle: EngineHandle,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<ProxyHealthPool>,
        session: HttpSession,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(TaskQueue::new(config.max_in_flight));
        let factory = TaskFactory::new(queue.clone(), config.initial_budget);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = EngineHandle {
            shutdown_tx: Arc::new(shutdown_tx),
            queue: queue.clone(),
            pool: pool.clone(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue,
                factory,
                pool,
                session,
                sink,
                classifier: Arc::new(DefaultClassifier::new()),
                counters: Counters::default(),
                shutdown,
            }),
            handle,
        })
    }

    /// Replace the failure classifier. Must be called before `run`.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.classifier = classifier,
            None => warn!("Scheduler already running, classifier not replaced"),
        }
        self
    }

    /// Seed the queue with the default budget
    pub fn enqueue<T: TaskBody + 'static>(&self, body: T) -> TaskId {
        self.shared.factory.spawn(body)
    }

    pub fn factory(&self) -> TaskFactory {
        self.shared.factory.clone()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.shared.queue
    }

    pub fn pool(&self) -> &Arc<ProxyHealthPool> {
        &self.shared.pool
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Run until every task has completed or been abandoned, or until shutdown
    #[instrument(skip(self), fields(workers = self.shared.config.workers))]
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        info!(
            pending = self.shared.queue.len(),
            max_in_flight = self.shared.config.max_in_flight,
            "Starting scheduler"
        );

        let workers: Vec<_> = (0..self.shared.config.workers)
            .map(|id| {
                let shared = self.shared.clone();
                tokio::spawn(async move { shared.worker(id).await })
            })
            .collect();

        let mut crashed_workers = 0;
        for result in join_all(workers).await {
            if let Err(e) = result {
                crashed_workers += 1;
                error!("Worker crashed: {}", e);
            }
        }

        let report = self.report(started.elapsed(), crashed_workers);
        info!("Scheduler finished: {}", report);
        report
    }

    fn report(&self, elapsed: Duration, crashed_workers: usize) -> RunReport {
        let counters = &self.shared.counters;
        let stats = self.shared.queue.stats();
        RunReport {
            enqueued: stats.enqueued,
            completed: counters.completed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            abandoned: stats.abandoned,
            unfinished: stats.pending,
            transport_failures: counters.transport_failures.load(Ordering::Relaxed),
            logic_failures: counters.logic_failures.load(Ordering::Relaxed),
            evicted_proxies: counters.evicted_proxies.load(Ordering::Relaxed),
            peak_in_flight: stats.peak_in_flight,
            crashed_workers,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

impl Shared {
    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Worker started");
        let mut shutdown = self.shutdown.clone();

        loop {
            let lease = match self.queue.next().await {
                Extraction::Task(lease) => lease,
                Extraction::Drained => {
                    debug!(worker = id, "Queue drained");
                    break;
                }
                Extraction::Closed => break,
            };

            let Some(proxy) = self.pool.acquire().await else {
                lease.release();
                break;
            };

            match self.execute(&lease, &proxy, &mut shutdown).await {
                Execution::Cancelled => {
                    lease.release();
                    break;
                }
                Execution::Finished(Ok(outcome)) => self.succeed(lease, &proxy, outcome),
                Execution::Finished(Err(e)) => {
                    self.fail(lease, &proxy, e);
                    if !self.config.failure_backoff.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.failure_backoff) => {}
                            _ = cancelled(&mut shutdown) => break,
                        }
                    }
                }
            }
        }

        debug!(worker = id, "Worker stopped");
    }

    #[instrument(skip_all, fields(task = %lease.id(), proxy = %proxy))]
    async fn execute(
        &self,
        lease: &TaskLease,
        proxy: &ProxyAddress,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Execution {
        let record = lease.record();
        let ctx = TaskContext {
            task_id: record.id,
            session: &self.session,
            proxy,
            factory: &self.factory,
            sink: self.sink.as_ref(),
        };

        let body = AssertUnwindSafe(record.body.execute(&ctx)).catch_unwind();

        tokio::select! {
            result = tokio::time::timeout(self.config.task_timeout, body) => {
                Execution::Finished(match result {
                    Err(_) => Err(CrawlError::Timeout),
                    Ok(Err(panic)) => Err(CrawlError::TaskPanicked(panic_message(panic.as_ref()))),
                    Ok(Ok(result)) => result,
                })
            }
            _ = cancelled(shutdown) => Execution::Cancelled,
        }
    }

    fn succeed(&self, lease: TaskLease, proxy: &ProxyAddress, outcome: TaskOutcome) {
        self.pool.report(proxy, false);
        match outcome {
            TaskOutcome::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(task = %lease.id(), proxy = %proxy, "Task completed");
            }
            TaskOutcome::Skipped => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(task = %lease.id(), proxy = %proxy, "Task skipped");
            }
        }
        lease.complete();
    }

    fn fail(&self, lease: TaskLease, proxy: &ProxyAddress, error: CrawlError) {
        let class = self.classifier.classify(&error);
        let penalty = match class {
            FailureClass::Transport(_) => {
                self.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
                if self.pool.report(proxy, true) == ReportOutcome::Evicted {
                    self.counters.evicted_proxies.fetch_add(1, Ordering::Relaxed);
                }
                self.config.transport_step()
            }
            FailureClass::Logic => {
                self.counters.logic_failures.fetch_add(1, Ordering::Relaxed);
                self.config.logic_decay
            }
        };

        let id = lease.id();
        let description = lease.record().body.describe();
        let attempts = lease.record().attempts;

        match lease.requeue(penalty) {
            RequeueOutcome::Requeued { remaining } => warn!(
                task = %id,
                description = %description,
                proxy = %proxy,
                class = class.as_str(),
                attempts,
                remaining,
                "Task failed, requeued: {}",
                error
            ),
            RequeueOutcome::Abandoned => error!(
                task = %id,
                description = %description,
                proxy = %proxy,
                class = class.as_str(),
                attempts,
                "Task abandoned after exhausting its attempt budget: {}",
                error
            ),
        }
    }
}

/// Resolves once shutdown has been requested
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Stops a running scheduler from outside
#[derive(Clone)]
pub struct EngineHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    queue: Arc<TaskQueue>,
    pool: Arc<ProxyHealthPool>,
}

impl EngineHandle {
    /// Cancel running tasks, close the queue and wake everything waiting on a proxy
    pub fn shutdown(&self) {
        info!("Shutting down scheduler");
        let _ = self.shutdown_tx.send(true);
        self.queue.close();
        self.pool.close();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FacilityRecord, Location, ProxyProtocol, Record};
    use crate::proxy::ProxyPoolConfig;
    use crate::sink::{ChannelSink, NullSink};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn create_test_proxy(port: u16) -> ProxyAddress {
        ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", port)
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            workers: 4,
            max_in_flight: 100,
            initial_budget: 10.0,
            transport_decay_factor: 0.01,
            logic_decay: 1.0,
            task_timeout: Duration::from_secs(5),
            failure_backoff: Duration::ZERO,
        }
    }

    fn pool_with(proxies: usize) -> Arc<ProxyHealthPool> {
        let pool = Arc::new(ProxyHealthPool::new(ProxyPoolConfig::default()));
        for port in 1..=proxies {
            pool.ingest(create_test_proxy(port as u16));
        }
        pool
    }

    fn scheduler(
        config: SchedulerConfig,
        pool: Arc<ProxyHealthPool>,
        sink: Arc<dyn RecordSink>,
    ) -> Scheduler {
        Scheduler::new(config, pool, HttpSession::default(), sink).unwrap()
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<Record>) -> Vec<Record> {
        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        records
    }

    fn facility(name: &str) -> FacilityRecord {
        FacilityRecord {
            name: name.to_string(),
            location: Location {
                city: "Austin".to_string(),
                ..Location::default()
            },
            categories: Vec::new(),
        }
    }

    /// Emits one record and spawns `children` leaf tasks
    struct Fanout {
        children: usize,
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskBody for Fanout {
        async fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            ctx.emit(facility("root"));
            for _ in 0..self.children {
                ctx.spawn(Fanout {
                    children: 0,
                    executions: self.executions.clone(),
                });
            }
            Ok(TaskOutcome::Completed)
        }
    }

    /// Always fails with the given error constructor
    struct AlwaysFail {
        error: fn() -> CrawlError,
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskBody for AlwaysFail {
        async fn execute(&self, _ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    /// Records which task ids are executing to detect double dispatch
    struct Exclusive {
        running: Arc<Mutex<HashSet<TaskId>>>,
        violations: Arc<AtomicUsize>,
        fail_first: bool,
    }

    #[async_trait]
    impl TaskBody for Exclusive {
        async fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
            if !self.running.lock().insert(ctx.task_id) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.running.lock().remove(&ctx.task_id);

            if self.fail_first && ctx.task_id.0 % 2 == 0 {
                return Err(CrawlError::UnexpectedContent("empty listing".to_string()));
            }
            Ok(TaskOutcome::Completed)
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskBody for Panics {
        async fn execute(&self, _ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
            panic!("selector returned nothing");
        }
    }

    struct Hangs;

    #[async_trait]
    impl TaskBody for Hangs {
        async fn execute(&self, _ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
            std::future::pending::<()>().await;
            Ok(TaskOutcome::Completed)
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(SchedulerConfig {
            workers: 0,
            ..SchedulerConfig::default()
        }
        .validate()
        .is_err());
        assert!(SchedulerConfig {
            transport_decay_factor: 0.0,
            ..SchedulerConfig::default()
        }
        .validate()
        .is_err());
        assert!(SchedulerConfig {
            initial_budget: f64::NAN,
            ..SchedulerConfig::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_children_run_and_records_reach_sink() {
        for children in [0usize, 1, 50] {
            let (sink, rx) = ChannelSink::new();
            let executions = Arc::new(AtomicUsize::new(0));
            let scheduler = scheduler(test_config(), pool_with(3), Arc::new(sink));
            scheduler.enqueue(Fanout {
                children,
                executions: executions.clone(),
            });

            let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
                .await
                .unwrap();

            assert_eq!(executions.load(Ordering::SeqCst), children + 1);
            assert_eq!(report.enqueued, children as u64 + 1);
            assert_eq!(report.completed, children as u64 + 1);
            assert_eq!(report.abandoned, 0);
            drop(scheduler);
            assert_eq!(drain(rx).len(), children + 1);
        }
    }

    #[tokio::test]
    async fn test_always_failing_task_is_dropped_after_budget() {
        let (sink, rx) = ChannelSink::new();
        let executions = Arc::new(AtomicUsize::new(0));
        // A step of 1.0 at budget 10
        let config = SchedulerConfig {
            transport_decay_factor: 0.1,
            ..test_config()
        };
        let scheduler = scheduler(config, pool_with(200), Arc::new(sink));
        scheduler.enqueue(AlwaysFail {
            error: || CrawlError::ConnectionRefused("upstream".to_string()),
            executions: executions.clone(),
        });

        let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 10);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.transport_failures, 10);
        assert_eq!(report.completed, 0);
        drop(scheduler);
        assert!(drain(rx).is_empty());
    }

    #[test]
    fn test_transport_step_is_a_fraction_of_the_budget() {
        let config = SchedulerConfig::default();
        assert!((config.transport_step() - 0.1).abs() < 1e-12);
        assert!((config.logic_decay / config.transport_step() - 10.0).abs() < 1e-9);

        let config = SchedulerConfig {
            initial_budget: 4.0,
            transport_decay_factor: 0.25,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.transport_step(), 1.0);
    }

    #[tokio::test]
    async fn test_transport_failures_cost_a_tenth() {
        let executions = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig {
            initial_budget: 1.0,
            transport_decay_factor: 0.1,
            ..test_config()
        };
        let scheduler = scheduler(config, pool_with(200), Arc::new(NullSink));
        scheduler.enqueue(AlwaysFail {
            error: || CrawlError::Timeout,
            executions: executions.clone(),
        });

        let report = scheduler.run().await;
        assert_eq!(executions.load(Ordering::SeqCst), 10);
        assert_eq!(report.abandoned, 1);
    }

    #[tokio::test]
    async fn test_logic_failure_does_not_blame_proxy() {
        let executions = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(1);
        let proxy = create_test_proxy(1);
        let scheduler = scheduler(test_config(), pool.clone(), Arc::new(NullSink));
        scheduler.enqueue(AlwaysFail {
            error: || CrawlError::UnexpectedContent("missing rating".to_string()),
            executions: executions.clone(),
        });

        let report = scheduler.run().await;
        assert_eq!(executions.load(Ordering::SeqCst), 10);
        assert_eq!(report.logic_failures, 10);
        assert_eq!(report.transport_failures, 0);
        assert_eq!(pool.health(&proxy).unwrap().total, 0);
        assert!(!pool.is_dead(&proxy));
    }

    #[tokio::test]
    async fn test_failing_proxy_is_evicted() {
        let executions = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(1);
        let proxy = create_test_proxy(1);
        let config = SchedulerConfig {
            workers: 1,
            initial_budget: 5.0,
            transport_decay_factor: 0.02,
            ..test_config()
        };
        let scheduler = scheduler(config, pool.clone(), Arc::new(NullSink));
        scheduler.enqueue(AlwaysFail {
            error: || CrawlError::ConnectionRefused("dead".to_string()),
            executions: executions.clone(),
        });

        // The only proxy dies after ten failures; the task then waits for a proxy
        // until shutdown.
        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pool.is_dead(&proxy) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 10);
        assert_eq!(report.evicted_proxies, 1);
        assert_eq!(report.unfinished, 1);
    }

    #[tokio::test]
    async fn test_no_task_runs_on_two_workers_at_once() {
        let running = Arc::new(Mutex::new(HashSet::new()));
        let violations = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig {
            workers: 20,
            ..test_config()
        };
        let scheduler = scheduler(config, pool_with(10), Arc::new(NullSink));
        for _ in 0..100 {
            scheduler.enqueue(Exclusive {
                running: running.clone(),
                violations: violations.clone(),
                fail_first: true,
            });
        }

        let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
            .await
            .unwrap();

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        // Odd ids complete, even ids fail until their budget runs out
        assert_eq!(report.completed, 50);
        assert_eq!(report.abandoned, 50);
        assert!(report.peak_in_flight <= 20);
        assert_eq!(report.crashed_workers, 0);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_cap() {
        let running = Arc::new(Mutex::new(HashSet::new()));
        let violations = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig {
            workers: 20,
            max_in_flight: 5,
            ..test_config()
        };
        let scheduler = scheduler(config, pool_with(10), Arc::new(NullSink));
        for _ in 0..100 {
            scheduler.enqueue(Exclusive {
                running: running.clone(),
                violations: violations.clone(),
                fail_first: false,
            });
        }

        let report = scheduler.run().await;
        assert_eq!(report.completed, 100);
        assert!(report.peak_in_flight <= 5);
    }

    #[tokio::test]
    async fn test_panicking_body_is_a_logic_failure() {
        let pool = pool_with(1);
        let scheduler = scheduler(test_config(), pool.clone(), Arc::new(NullSink));
        scheduler.enqueue(Panics);

        let report = scheduler.run().await;
        assert_eq!(report.logic_failures, 10);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.crashed_workers, 0);
        assert_eq!(pool.health(&create_test_proxy(1)).unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_a_transport_failure() {
        let config = SchedulerConfig {
            initial_budget: 0.2,
            task_timeout: Duration::from_millis(20),
            ..test_config()
        };
        let scheduler = scheduler(config, pool_with(1), Arc::new(NullSink));
        scheduler.enqueue(Hangs);

        let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .unwrap();
        assert_eq!(report.transport_failures, 2);
        assert_eq!(report.abandoned, 1);
    }

    #[tokio::test]
    async fn test_workers_wait_for_proxies() {
        let pool = Arc::new(ProxyHealthPool::new(ProxyPoolConfig::default()));
        let executions = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(test_config(), pool.clone(), Arc::new(NullSink));
        scheduler.enqueue(Fanout {
            children: 0,
            executions: executions.clone(),
        });

        let run = tokio::spawn(async move { scheduler.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 0);

        pool.ingest(create_test_proxy(1));
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_hanging_tasks() {
        let config = SchedulerConfig {
            task_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let scheduler = scheduler(config, pool_with(1), Arc::new(NullSink));
        for _ in 0..3 {
            scheduler.enqueue(Hangs);
        }

        let handle = scheduler.handle();
        let run = tokio::spawn(async move { scheduler.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.shutdown();
        assert!(handle.is_shutdown());
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.completed, 0);
        assert_eq!(report.unfinished, 3);
    }

    #[test]
    fn test_report_display() {
        let report = RunReport {
            enqueued: 12,
            completed: 9,
            skipped: 1,
            abandoned: 2,
            ..RunReport::default()
        };
        assert!(report.to_string().starts_with("10 of 12 tasks completed"));
    }
}
