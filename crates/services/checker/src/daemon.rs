//! The checker daemon: discovery, work queue, worker pool, lifecycle.
//!
//! A scanner task periodically lists all instances from the KV store,
//! filters them, and enqueues unseen ones into the pending queue. Worker
//! tasks pop instances, claim an exclusive check-job lease, and run the
//! per-instance checks. A lease task renews held leases; losing one stops
//! the in-flight checker. An inspector task walks all instances at the
//! scan cadence and alarms when check recency falls behind the bucket
//! lifecycle.
//!
//! All shared scheduling state lives behind one mutex; blocking work
//! (KV calls, vault listings) always happens outside it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use backon::{ExponentialBuilder, Retryable};
use futures::StreamExt;
use meta_kv::{KvError, RangeGetOptions, TxnKv, keys};
use monitoring::logging;
use strata_config::Config;
use tokio::{sync::Notify, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use vault_store::AccessorFactory;

use crate::{
    filter::InstanceFilter,
    instance::{CheckError, CheckOutcome, InstanceChecker},
    lease::{self, LeaseError, PrepareError},
    metrics::CheckerMetrics,
    model::{InstanceInfo, InstanceStatus, JobRecord, JobStatus},
    now_ms,
    sync_executor::TaskPool,
};

/// The checker daemon. Owns its tasks from [`start`](Checker::start) until
/// [`stop`](Checker::stop).
pub struct Checker {
    ctx: Arc<CheckerCtx>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Checker {
    pub fn new(
        txn_kv: Arc<dyn TxnKv>,
        config: Arc<Config>,
        factory: Arc<dyn AccessorFactory>,
        metrics: Arc<CheckerMetrics>,
        lessee: String,
    ) -> Self {
        let filter = InstanceFilter::new(
            config.recycle_whitelist.iter().cloned(),
            config.recycle_blacklist.iter().cloned(),
        );
        let pool = TaskPool::new(config.recycle_concurrency);
        Self {
            ctx: Arc::new(CheckerCtx {
                txn_kv,
                config,
                factory,
                metrics,
                lessee,
                filter,
                pool,
                state: Mutex::new(ScheduleState::default()),
                pending_notify: Notify::new(),
                stop: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Launch the scanner, lease, inspector, and worker tasks.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(scanner_loop(self.ctx.clone())));
        tasks.push(tokio::spawn(lease_loop(self.ctx.clone())));
        tasks.push(tokio::spawn(inspector_loop(self.ctx.clone())));
        for _ in 0..self.ctx.config.recycle_concurrency {
            tasks.push(tokio::spawn(worker_loop(self.ctx.clone())));
        }
    }

    /// Request shutdown, stop in-flight checkers, and join every task.
    pub async fn stop(&self) {
        self.ctx.stop.cancel();
        self.ctx.pending_notify.notify_waiters();
        let checkers = self.ctx.state.lock().unwrap().working_checkers();
        for checker in checkers {
            checker.stop();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn stopped(&self) -> bool {
        self.ctx.stop.is_cancelled()
    }

    /// Inspect one instance's check recency against its bucket lifecycle.
    /// Returns the alarm details when one fires.
    pub async fn do_inspect(&self, instance: &InstanceInfo) -> Option<CheckIntervalAlarm> {
        self.ctx.do_inspect(instance).await
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        if !self.ctx.stop.is_cancelled() {
            self.ctx.stop.cancel();
            for task in self.tasks.lock().unwrap().drain(..) {
                task.abort();
            }
        }
    }
}

struct CheckerCtx {
    txn_kv: Arc<dyn TxnKv>,
    config: Arc<Config>,
    factory: Arc<dyn AccessorFactory>,
    metrics: Arc<CheckerMetrics>,
    /// `ip:port` identity written into job records held by this process.
    lessee: String,
    filter: InstanceFilter,
    pool: Arc<TaskPool>,
    state: Mutex<ScheduleState>,
    pending_notify: Notify,
    stop: CancellationToken,
}

/// Scheduling state shared by the scanner and the workers.
///
/// Invariants: `pending_set` keys mirror `pending_queue` ids, and no
/// instance is pending and working at the same time.
#[derive(Default)]
struct ScheduleState {
    pending_queue: VecDeque<InstanceInfo>,
    /// instance_id -> enqueue time, seconds since epoch.
    pending_set: HashMap<String, i64>,
    working_set: HashMap<String, Arc<InstanceChecker>>,
}

impl ScheduleState {
    /// Enqueue an instance unless it is already pending or being worked.
    fn enqueue(&mut self, instance: InstanceInfo, enqueue_time_s: i64) -> bool {
        let id = &instance.instance_id;
        if self.pending_set.contains_key(id) || self.working_set.contains_key(id) {
            return false;
        }
        self.pending_set.insert(id.clone(), enqueue_time_s);
        self.pending_queue.push_back(instance);
        true
    }

    fn pop(&mut self) -> Option<(InstanceInfo, i64)> {
        let instance = self.pending_queue.pop_front()?;
        let enqueue_time_s = self
            .pending_set
            .remove(&instance.instance_id)
            .unwrap_or_default();
        Some((instance, enqueue_time_s))
    }

    fn is_working(&self, instance_id: &str) -> bool {
        self.working_set.contains_key(instance_id)
    }

    /// Record an instance as being worked; rejects duplicates.
    fn begin_work(&mut self, instance_id: &str, checker: Arc<InstanceChecker>) -> bool {
        if self.working_set.contains_key(instance_id) {
            return false;
        }
        self.working_set.insert(instance_id.to_string(), checker);
        true
    }

    fn finish_work(&mut self, instance_id: &str) {
        self.working_set.remove(instance_id);
    }

    fn get_working(&self, instance_id: &str) -> Option<Arc<InstanceChecker>> {
        self.working_set.get(instance_id).cloned()
    }

    fn working_ids(&self) -> Vec<String> {
        self.working_set.keys().cloned().collect()
    }

    fn working_checkers(&self) -> Vec<Arc<InstanceChecker>> {
        self.working_set.values().cloned().collect()
    }
}

/// List every instance record, skipping malformed ones. Transport errors
/// are retried with exponential backoff before giving up for the cycle.
async fn get_all_instances(txn_kv: &Arc<dyn TxnKv>) -> Result<Vec<InstanceInfo>, KvError> {
    (|| async {
        let (begin, end) = keys::instance_range();
        let mut stream = txn_kv.full_range_get(&begin, &end, RangeGetOptions::prefetching());
        let mut instances = Vec::new();
        while let Some(item) = stream.next().await {
            let (key, value) = item?;
            match serde_json::from_slice::<InstanceInfo>(&value) {
                Ok(instance) => instances.push(instance),
                Err(err) => tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "malformed instance record, skipping"
                ),
            }
        }
        Ok(instances)
    })
    .retry(ExponentialBuilder::default())
    .when(|err: &KvError| matches!(err, KvError::Transport(_)))
    .notify(|err, dur| {
        tracing::warn!(
            error = %err,
            "failed to list instances, retrying in {:.1}s",
            dur.as_secs_f32()
        );
    })
    .await
}

async fn scanner_loop(ctx: Arc<CheckerCtx>) {
    while !ctx.stop.is_cancelled() {
        match get_all_instances(&ctx.txn_kv).await {
            Ok(instances) => {
                tracing::info!(count = instances.len(), "checker fetched instances");
                if !instances.is_empty() {
                    let enqueue_time_s = now_ms() / 1000;
                    let mut enqueued = 0;
                    {
                        let mut state = ctx.state.lock().unwrap();
                        for instance in instances {
                            if ctx.filter.filter_out(&instance.instance_id) {
                                continue;
                            }
                            if instance.status == InstanceStatus::Deleted {
                                continue;
                            }
                            if state.enqueue(instance, enqueue_time_s) {
                                enqueued += 1;
                            }
                        }
                    }
                    if enqueued > 0 {
                        ctx.pending_notify.notify_waiters();
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    error_source = logging::error_source(&err),
                    "failed to scan instances"
                );
            }
        }

        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            _ = sleep(ctx.config.scan_interval) => {}
        }
    }
}

/// Wait for a pending instance; `None` means the daemon is stopping.
async fn next_pending(ctx: &CheckerCtx) -> Option<(InstanceInfo, i64)> {
    loop {
        let mut notified = std::pin::pin!(ctx.pending_notify.notified());
        // Register for wakeups before checking the queue, so an enqueue
        // between the check and the await is not lost.
        notified.as_mut().enable();

        if let Some(entry) = ctx.state.lock().unwrap().pop() {
            return Some(entry);
        }
        if ctx.stop.is_cancelled() {
            return None;
        }

        tokio::select! {
            _ = ctx.stop.cancelled() => return None,
            _ = notified => {}
        }
    }
}

async fn worker_loop(ctx: Arc<CheckerCtx>) {
    while let Some((instance, enqueue_time_s)) = next_pending(&ctx).await {
        let instance_id = instance.instance_id.clone();

        // Skip instances a late duplicate enqueue raced into the queue.
        if ctx.state.lock().unwrap().is_working(&instance_id) {
            continue;
        }

        let mut checker = InstanceChecker::new(
            ctx.txn_kv.clone(),
            instance_id.clone(),
            ctx.factory.clone(),
            ctx.metrics.clone(),
            ctx.pool.clone(),
        );
        if let Err(err) = checker.init(&instance).await {
            tracing::warn!(
                instance_id = %instance_id,
                error = %err,
                error_source = logging::error_source(&err),
                "failed to init instance checker"
            );
            continue;
        }
        let checker = Arc::new(checker);

        match lease::prepare_check_job(
            ctx.txn_kv.as_ref(),
            &instance_id,
            &ctx.lessee,
            ctx.config.check_object_interval,
        )
        .await
        {
            Ok(()) => {}
            Err(PrepareError::Conflict { lessee }) => {
                tracing::debug!(
                    instance_id = %instance_id,
                    held_by = %lessee,
                    "check job busy, skipping this cycle"
                );
                continue;
            }
            Err(err) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "failed to prepare check job"
                );
                continue;
            }
        }

        if !ctx
            .state
            .lock()
            .unwrap()
            .begin_work(&instance_id, checker.clone())
        {
            continue;
        }
        if ctx.stop.is_cancelled() {
            ctx.state.lock().unwrap().finish_work(&instance_id);
            break;
        }

        let ctime_ms = now_ms();
        ctx.metrics
            .enqueue_cost_s
            .with_label_values(&[instance_id.as_str()])
            .set(ctime_ms / 1000 - enqueue_time_s);

        let forward = checker.do_check().await;
        let inverted = if ctx.config.enable_inverted_check {
            Some(checker.do_inverted_check().await)
        } else {
            None
        };

        // The job record stays untouched on unrecoverable errors (and on
        // inverted-check findings, which demand human inspection) so the
        // lease expires and another process can take over.
        let finish_success = match (&forward, &inverted) {
            (Err(_), _) => None,
            (Ok(_), Some(Err(_))) => None,
            (Ok(_), Some(Ok(CheckOutcome::LossDetected))) => None,
            (Ok(outcome), _) => Some(outcome.is_clean()),
        };

        if let Err(err) = &forward {
            if !matches!(err, CheckError::Aborted) {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %err,
                    error_source = logging::error_source(err),
                    "instance check did not complete"
                );
            }
        }

        if let Some(success) = finish_success {
            if !checker.stopped() {
                if let Err(err) = lease::finish_check_job(
                    ctx.txn_kv.as_ref(),
                    &instance_id,
                    &ctx.lessee,
                    success,
                    ctime_ms,
                )
                .await
                {
                    tracing::warn!(
                        instance_id = %instance_id,
                        error = %err,
                        error_source = logging::error_source(&err),
                        "failed to finish check job"
                    );
                }
            }
        }

        ctx.state.lock().unwrap().finish_work(&instance_id);
    }
}

async fn lease_loop(ctx: Arc<CheckerCtx>) {
    while !ctx.stop.is_cancelled() {
        let ids = ctx.state.lock().unwrap().working_ids();
        for instance_id in ids {
            match lease::lease_check_job(
                ctx.txn_kv.as_ref(),
                &instance_id,
                &ctx.lessee,
                ctx.config.lease_expiration,
            )
            .await
            {
                Ok(()) => {}
                Err(LeaseError::Lost) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        "check job lease lost, stopping in-flight checker"
                    );
                    if let Some(checker) = ctx.state.lock().unwrap().get_working(&instance_id) {
                        checker.stop();
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        error = %err,
                        error_source = logging::error_source(&err),
                        "failed to renew check job lease"
                    );
                }
            }
        }

        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            _ = sleep(ctx.config.lease_expiration / 3) => {}
        }
    }
}

async fn inspector_loop(ctx: Arc<CheckerCtx>) {
    while !ctx.stop.is_cancelled() {
        tracing::info!("start to inspect instance check interval");
        match get_all_instances(&ctx.txn_kv).await {
            Ok(instances) => {
                for instance in &instances {
                    if ctx.filter.filter_out(&instance.instance_id) {
                        continue;
                    }
                    if ctx.stop.is_cancelled() {
                        return;
                    }
                    if instance.status == InstanceStatus::Deleted {
                        continue;
                    }
                    ctx.do_inspect(instance).await;
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    error_source = logging::error_source(&err),
                    "failed to list instances for inspection"
                );
            }
        }

        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            _ = sleep(ctx.config.scan_interval) => {}
        }
    }
}

/// Details of a fired check-interval alarm.
#[derive(Debug, Clone)]
pub struct CheckIntervalAlarm {
    pub instance_id: String,
    pub last_ctime_ms: i64,
    pub job_status: Option<JobStatus>,
    pub bucket_lifecycle_days: i64,
    pub reserved_buffer_days: i64,
    pub expiration_ms: i64,
}

impl CheckerCtx {
    /// Compare an instance's check recency against its bucket lifecycle
    /// and alarm when unexpired objects are at risk.
    async fn do_inspect(&self, instance: &InstanceInfo) -> Option<CheckIntervalAlarm> {
        let instance_id = &instance.instance_id;
        let key = keys::job_check_key(instance_id);

        let mut txn = match self.txn_kv.create_txn().await {
            Ok(txn) => txn,
            Err(err) => {
                tracing::warn!(instance_id = %instance_id, error = %err, "Err for check interval: failed to create txn");
                return None;
            }
        };
        // A missing record only means the instance was never checked.
        let value = match txn.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(instance_id = %instance_id, error = %err, "Err for check interval: failed to get job record");
                return None;
            }
        };

        let mut checker = InstanceChecker::new(
            self.txn_kv.clone(),
            instance_id.clone(),
            self.factory.clone(),
            self.metrics.clone(),
            self.pool.clone(),
        );
        if let Err(err) = checker.init(instance).await {
            tracing::warn!(
                instance_id = %instance_id,
                error = %err,
                error_source = logging::error_source(&err),
                "Err for check interval: failed to init instance checker"
            );
            return None;
        }

        let bucket_lifecycle_days = match checker.get_bucket_lifecycle().await {
            Ok(Some(days)) => days,
            // No S3 vaults: nothing expires, skip the inspection.
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "Err for check interval: failed to get bucket lifecycle"
                );
                return None;
            }
        };

        let mut job_status = None;
        let mut record_ctime_ms = None;
        if let Some(value) = value {
            match JobRecord::decode(&value) {
                Ok(record) => {
                    job_status = Some(record.status);
                    record_ctime_ms = record.last_ctime_ms;
                    if let Some(ms) = record.last_success_time_ms {
                        self.metrics
                            .last_success_time_ms
                            .with_label_values(&[instance_id.as_str()])
                            .set(ms);
                    }
                }
                Err(err) => {
                    tracing::warn!(instance_id = %instance_id, error = %err, "Err for check interval: failed to parse job record");
                }
            }
        }
        // Instances that never produced a job record fall back to their
        // creation time.
        let last_ctime_ms = record_ctime_ms.unwrap_or(instance.ctime_ms);

        let expiration = expiration_ms(bucket_lifecycle_days, self.config.reserved_buffer_days);
        if now_ms() - last_ctime_ms >= expiration {
            tracing::warn!(
                last_ctime_ms,
                job_status = ?job_status,
                bucket_lifecycle_days,
                reserved_buffer_days = self.config.reserved_buffer_days,
                expiration_ms = expiration,
                "Err for check interval: check risks, instance_id: {instance_id}"
            );
            return Some(CheckIntervalAlarm {
                instance_id: instance_id.clone(),
                last_ctime_ms,
                job_status,
                bucket_lifecycle_days,
                reserved_buffer_days: self.config.reserved_buffer_days,
                expiration_ms: expiration,
            });
        }
        None
    }
}

/// Time budget before an unchecked instance risks losing unexpired
/// objects. The buffer is only subtracted when the lifecycle exceeds it.
fn expiration_ms(lifecycle_days: i64, reserved_buffer_days: i64) -> i64 {
    const DAY_MS: i64 = 86_400_000;
    if lifecycle_days > reserved_buffer_days {
        (lifecycle_days - reserved_buffer_days) * DAY_MS
    } else {
        lifecycle_days * DAY_MS
    }
}
