//! 同步引擎 - 串行消费待同步队列
//!
//! 每个同步周期按入队顺序逐条处理 `Pending` 记录：
//! 1. 标记 `InFlight`
//! 2. 经远端桥接执行
//! 3. 成功 -> `Completed`；冲突 -> 解决后回到 `Pending`，下一周期重试；
//!    瞬时失败 -> `Failed`（可按退避自动重试）；永久失败 -> `Failed` 并上报
//!
//! 同一时刻最多只有一个同步周期在运行，并发触发会被合并；
//! 被合并的触发在当前周期结束后补跑一轮。有记录因冲突推迟时，紧接着开始下一周期。

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{ErrorCategory, ErrorSeverity, Result};
use crate::events::{EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::queue::{
    FailureReason, MutationKind, MutationRecord, MutationStatus, ResetFilter, RetryPolicy, StatusPatch, SyncQueue,
};
use crate::remote::{Outcome, RemoteBridge, RemoteErrorCode};
use crate::storage::{ErrorReport, ErrorReporter};
use crate::sync::resolver::ConflictResolver;
use crate::utils::TimeFormatter;

/// 同步周期的触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrainTrigger {
    /// 在线时有新变更入队
    Enqueue,
    /// 网络恢复
    Reconnect,
    /// 人工重试
    ManualRetry,
    /// 退避到期的自动重试
    ScheduledRetry,
    /// 应用回到前台
    Foreground,
    /// 宿主显式调用
    Explicit,
}

/// 未执行同步的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDraining,
    Offline,
}

/// 一次触发的结果
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    Skipped(SkipReason),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }
}

/// 同步周期统计
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub trigger: DrainTrigger,
    /// 提交到远端的记录数
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// 冲突已解决、推迟到下一周期的记录数
    pub deferred: usize,
    /// 因同一目标的前序记录未成功而保留到下一周期的记录数
    pub held_back: usize,
    /// 处理过程中的内部错误（存储失败、panic）
    pub errors: usize,
    /// 本次触发实际运行的周期数
    pub cycles: usize,
    pub duration_ms: u64,
}

impl DrainReport {
    fn new(trigger: DrainTrigger) -> Self {
        Self {
            trigger,
            processed: 0,
            completed: 0,
            failed: 0,
            deferred: 0,
            held_back: 0,
            errors: 0,
            cycles: 0,
            duration_ms: 0,
        }
    }

    fn absorb(&mut self, cycle: &DrainReport) {
        self.processed += cycle.processed;
        self.completed += cycle.completed;
        self.failed += cycle.failed;
        self.deferred += cycle.deferred;
        self.held_back += cycle.held_back;
        self.errors += cycle.errors;
        self.cycles += 1;
    }
}

/// 退避重试计划，由调度器消费
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub id: String,
    /// UTC 毫秒
    pub at: i64,
}

/// 单条记录的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordResult {
    Completed,
    Deferred,
    Failed,
    /// 记录已被外部移除
    Vanished,
}

/// 周期结束时恢复空闲状态
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 同步引擎
pub struct SyncEngine {
    queue: Arc<SyncQueue>,
    bridge: RemoteBridge,
    resolver: ConflictResolver,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    reporter: Arc<dyn ErrorReporter>,
    retry_policy: RetryPolicy,
    config: EngineConfig,
    draining: AtomicBool,
    /// 运行期间有触发被合并
    rerun_requested: AtomicBool,
    retry_sink: Mutex<Option<mpsc::UnboundedSender<ScheduledRetry>>>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("draining", &self.is_draining())
            .field("config", &self.config)
            .finish()
    }
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<SyncQueue>,
        bridge: RemoteBridge,
        resolver: ConflictResolver,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        reporter: Arc<dyn ErrorReporter>,
        retry_policy: RetryPolicy,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            bridge,
            resolver,
            network,
            events,
            reporter,
            retry_policy,
            config,
            draining: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            retry_sink: Mutex::new(None),
            tasks: TaskTracker::new(),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// 设置退避重试计划的接收端
    pub fn set_retry_sink(&self, sink: mpsc::UnboundedSender<ScheduledRetry>) {
        *self.retry_sink.lock() = Some(sink);
    }

    /// 触发同步
    ///
    /// 离线或已有周期在运行时立即返回 `Skipped`；后者会让运行中的周期结束后再补跑一轮。
    #[instrument(skip(self))]
    pub async fn trigger(&self, trigger: DrainTrigger) -> Result<DrainOutcome> {
        if !self.network.is_online() {
            debug!("离线，跳过同步 ({:?})", trigger);
            return Ok(DrainOutcome::Skipped(SkipReason::Offline));
        }
        if !self.claim_or_coalesce() {
            debug!("已有同步周期在运行，合并触发 ({:?})", trigger);
            return Ok(DrainOutcome::Skipped(SkipReason::AlreadyDraining));
        }

        let started = Instant::now();
        let mut report = DrainReport::new(trigger);
        loop {
            let result = {
                let _guard = DrainGuard(&self.draining);
                self.run_cycles(trigger, &mut report).await
            };
            result?;

            // 标志已释放：补跑释放前被合并的触发
            if !self.rerun_requested.swap(false, Ordering::SeqCst) || !self.network.is_online() {
                break;
            }
            if !self.try_claim() {
                break;
            }
            debug!("补跑被合并的触发 ({:?})", trigger);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "✅ 同步结束 ({:?}): {} 个周期 处理 {} 完成 {} 失败 {} 推迟 {} 保留 {} 耗时 {}ms",
            trigger,
            report.cycles,
            report.processed,
            report.completed,
            report.failed,
            report.deferred,
            report.held_back,
            report.duration_ms
        );
        Ok(DrainOutcome::Completed(report))
    }

    fn try_claim(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 抢占同步标志；失败时登记补跑请求
    ///
    /// 登记后若发现标志恰好已释放，再抢一次，避免请求落在持有者的最后检查之后。
    fn claim_or_coalesce(&self) -> bool {
        loop {
            if self.try_claim() {
                return true;
            }
            self.rerun_requested.store(true, Ordering::SeqCst);
            if self.draining.load(Ordering::SeqCst) {
                return false;
            }
        }
    }

    /// 连续运行同步周期，直到没有因冲突推迟的记录
    async fn run_cycles(&self, trigger: DrainTrigger, report: &mut DrainReport) -> Result<()> {
        loop {
            self.rerun_requested.store(false, Ordering::SeqCst);
            let cycle = self.run_cycle(trigger).await?;
            report.absorb(&cycle);

            if cycle.deferred == 0 || !self.network.is_online() {
                return Ok(());
            }
            debug!("{} 条冲突记录已解决，开始下一周期", cycle.deferred);
        }
    }

    async fn run_cycle(&self, trigger: DrainTrigger) -> Result<DrainReport> {
        self.events
            .emit(SyncEvent::DrainStarted {
                trigger,
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;

        let started = Instant::now();
        let mut cycle = DrainReport::new(trigger);
        let result = self.drain(&mut cycle).await;
        cycle.duration_ms = started.elapsed().as_millis() as u64;

        self.events
            .emit(SyncEvent::DrainFinished {
                trigger,
                processed: cycle.processed,
                completed: cycle.completed,
                failed: cycle.failed,
                deferred: cycle.deferred,
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;

        result.map(|_| cycle)
    }

    /// 在后台任务中触发同步
    pub fn spawn_trigger(self: &Arc<Self>, trigger: DrainTrigger) {
        let engine = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = engine.trigger(trigger).await {
                error!("后台同步失败 ({:?}): {}", trigger, e);
            }
        });
    }

    /// 等待后台同步任务全部结束
    pub async fn wait_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// 人工重试：所有失败记录回到 Pending 并触发同步
    pub async fn retry_failed_operations(&self) -> Result<DrainOutcome> {
        let reset = self.queue.reset_failed(ResetFilter::All).await?;
        for record in &reset {
            self.emit_status(&record.id, MutationStatus::Failed, MutationStatus::Pending, record.retry_count)
                .await;
        }
        self.trigger(DrainTrigger::ManualRetry).await
    }

    /// 网络恢复：瞬时失败且未达上限的记录回到 Pending 并触发同步
    pub async fn on_reconnect(&self) -> Result<DrainOutcome> {
        let reset = self.queue.reset_failed(ResetFilter::AutoRetryable).await?;
        for record in &reset {
            self.emit_status(&record.id, MutationStatus::Failed, MutationStatus::Pending, record.retry_count)
                .await;
        }
        self.trigger(DrainTrigger::Reconnect).await
    }

    /// 退避到期：记录仍可自动重试时回到 Pending 并触发同步
    pub async fn retry_due(&self, id: &str) -> Result<DrainOutcome> {
        if let Some(record) = self.queue.get(id).await? {
            let due = record.next_retry_at.map(|at| at <= TimeFormatter::now_utc_millis()).unwrap_or(false);
            if record.is_auto_retryable() && due {
                let patch = StatusPatch::new().next_retry_at(None);
                if self
                    .queue
                    .update_status(id, MutationStatus::Pending, Some(patch))
                    .await?
                    .is_some()
                {
                    self.emit_status(id, MutationStatus::Failed, MutationStatus::Pending, record.retry_count)
                        .await;
                }
            }
        }
        self.trigger(DrainTrigger::ScheduledRetry).await
    }

    async fn drain(&self, report: &mut DrainReport) -> Result<()> {
        let mut visited: HashSet<String> = HashSet::new();
        // 目标 (collection, id) -> 最早一条未成功记录的序号，后入队的同目标记录须等待
        let mut blocked = self.unsettled_targets().await?;

        loop {
            if !self.network.is_online() {
                info!("网络已断开，提前结束本轮同步");
                break;
            }

            let pending = self.queue.list(Some(MutationStatus::Pending)).await?;
            let Some(record) = pending.into_iter().find(|r| !visited.contains(&r.id)) else {
                break;
            };
            visited.insert(record.id.clone());

            let target = record.target_id().map(|id| (record.collection.clone(), id));
            if let Some(key) = &target {
                if blocked.get(key).is_some_and(|&seq| seq < record.seq) {
                    debug!("同一目标的前序变更未成功，保留到下一周期: {}", record.details());
                    report.held_back += 1;
                    continue;
                }
            }

            let record_id = record.id.clone();
            let record_seq = record.seq;
            let step = AssertUnwindSafe(self.process_record(record)).catch_unwind().await;
            let succeeded = match step {
                Ok(Ok(RecordResult::Completed)) => {
                    report.processed += 1;
                    report.completed += 1;
                    true
                }
                Ok(Ok(RecordResult::Deferred)) => {
                    report.processed += 1;
                    report.deferred += 1;
                    false
                }
                Ok(Ok(RecordResult::Failed)) => {
                    report.processed += 1;
                    report.failed += 1;
                    false
                }
                Ok(Ok(RecordResult::Vanished)) => true,
                Ok(Err(e)) => {
                    error!("处理变更 {} 出错: {}", record_id, e);
                    report.errors += 1;
                    self.reporter
                        .report(ErrorReport::from_error(&e).with_context(json!({ "mutation_id": record_id })))
                        .await;
                    false
                }
                Err(_) => {
                    error!("处理变更 {} 时发生 panic", record_id);
                    report.errors += 1;
                    self.fail_after_panic(&record_id).await;
                    false
                }
            };

            if !succeeded {
                if let Some(key) = target {
                    let seq = blocked.entry(key).or_insert(record_seq);
                    *seq = (*seq).min(record_seq);
                }
            }
        }

        Ok(())
    }

    /// 失败或仍在提交中的记录所占用的目标
    async fn unsettled_targets(&self) -> Result<HashMap<(String, String), u64>> {
        let mut targets = HashMap::new();
        for record in self.queue.list(None).await? {
            if !matches!(record.status, MutationStatus::Failed | MutationStatus::InFlight) {
                continue;
            }
            if let Some(id) = record.target_id() {
                // list 按序号升序，首次出现即最小序号
                targets.entry((record.collection.clone(), id)).or_insert(record.seq);
            }
        }
        Ok(targets)
    }

    async fn process_record(&self, record: MutationRecord) -> Result<RecordResult> {
        let Some(record) = self
            .transition(&record.id, MutationStatus::Pending, MutationStatus::InFlight, None)
            .await?
        else {
            return Ok(RecordResult::Vanished);
        };

        debug!("提交变更: {}", record.details());
        let outcome = self.bridge.execute(record.kind, &record.collection, &record.payload).await;

        match outcome {
            Outcome::Ok(_) => {
                let patch = StatusPatch::new().clear_failure();
                self.transition(&record.id, MutationStatus::InFlight, MutationStatus::Completed, Some(patch))
                    .await?;
                Ok(RecordResult::Completed)
            }
            Outcome::Conflict { remote, code, message } => {
                self.handle_conflict(&record, remote, code, message).await
            }
            Outcome::TransientError { reason, message } => {
                let retry_count = record.retry_count + 1;
                let exhausted = self.retry_policy.is_exhausted(retry_count);
                let next_retry_at = if self.config.auto_retry {
                    self.retry_policy.next_retry_at(retry_count, &reason)
                } else {
                    None
                };

                warn!("变更 {} 瞬时失败 ({}): {}", record.id, reason, message);
                let patch = StatusPatch::new()
                    .retry_count(retry_count)
                    .failure(reason, message.clone())
                    .next_retry_at(next_retry_at)
                    .requires_manual(exhausted);
                self.transition(&record.id, MutationStatus::InFlight, MutationStatus::Failed, Some(patch))
                    .await?;

                if let Some(at) = next_retry_at {
                    self.schedule_retry(&record.id, at);
                }
                if exhausted {
                    self.reporter
                        .report(
                            ErrorReport::new(
                                ErrorCategory::Sync,
                                ErrorSeverity::High,
                                format!("重试 {} 次后仍失败，需要人工处理: {}", retry_count, message),
                            )
                            .with_context(mutation_context(&record)),
                        )
                        .await;
                }
                Ok(RecordResult::Failed)
            }
            Outcome::PermanentError { reason, message } => {
                error!("变更 {} 永久失败 ({}): {}", record.id, reason, message);
                let patch = StatusPatch::new()
                    .retry_count(record.retry_count + 1)
                    .failure(reason.clone(), message.clone())
                    .next_retry_at(None)
                    .requires_manual(true);
                self.transition(&record.id, MutationStatus::InFlight, MutationStatus::Failed, Some(patch))
                    .await?;

                let category = match reason {
                    FailureReason::AuthFailure => ErrorCategory::Auth,
                    FailureReason::Malformed => ErrorCategory::Validation,
                    _ => ErrorCategory::Sync,
                };
                self.reporter
                    .report(
                        ErrorReport::new(category, ErrorSeverity::High, message)
                            .with_context(mutation_context(&record)),
                    )
                    .await;
                Ok(RecordResult::Failed)
            }
        }
    }

    async fn handle_conflict(
        &self,
        record: &MutationRecord,
        remote: Option<serde_json::Value>,
        code: RemoteErrorCode,
        message: String,
    ) -> Result<RecordResult> {
        let conflict_count = record.conflict_count + 1;

        if conflict_count > self.config.max_conflict_retries {
            warn!("变更 {} 连续冲突 {} 次，需要人工处理", record.id, conflict_count);
            let patch = StatusPatch::new()
                .retry_count(record.retry_count + 1)
                .conflict_count(conflict_count)
                .failure(FailureReason::Conflict, message.clone())
                .next_retry_at(None)
                .requires_manual(true);
            self.transition(&record.id, MutationStatus::InFlight, MutationStatus::Failed, Some(patch))
                .await?;
            self.reporter
                .report(
                    ErrorReport::new(
                        ErrorCategory::Sync,
                        ErrorSeverity::Medium,
                        format!("冲突无法自动解决: {}", message),
                    )
                    .with_context(mutation_context(record)),
                )
                .await;
            return Ok(RecordResult::Failed);
        }

        let resolution = self.resolver.resolve(&record.collection, &record.payload, remote.as_ref());
        let mut patch = StatusPatch::new()
            .conflict_resolution(resolution.tag)
            .conflict_count(conflict_count)
            .failure(FailureReason::Conflict, message);

        // 插入撞上唯一约束：记录已存在，改为更新同一 id
        let resolved_has_id = resolution.payload.get("id").map(|v| !v.is_null()).unwrap_or(false);
        if record.kind == MutationKind::Create && code == RemoteErrorCode::UniqueViolation && resolved_has_id {
            patch = patch.kind(MutationKind::Update);
        }
        patch = patch.payload(resolution.payload);

        self.transition(&record.id, MutationStatus::InFlight, MutationStatus::Pending, Some(patch))
            .await?;
        info!("变更 {} 冲突已解决 ({:?})，下一周期重试", record.id, resolution.tag);

        self.events
            .emit(SyncEvent::ConflictResolved {
                id: record.id.clone(),
                collection: record.collection.clone(),
                resolution: resolution.tag,
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;
        Ok(RecordResult::Deferred)
    }

    async fn fail_after_panic(&self, id: &str) {
        let patch = StatusPatch::new().failure(FailureReason::Unknown("panic".to_string()), "处理过程中发生 panic");
        match self.queue.get(id).await {
            Ok(Some(record)) if record.status == MutationStatus::InFlight => {
                let patch = patch.retry_count(record.retry_count + 1).requires_manual(true);
                if let Err(e) = self
                    .transition(id, MutationStatus::InFlight, MutationStatus::Failed, Some(patch))
                    .await
                {
                    error!("panic 后标记失败出错: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => error!("panic 后读取记录失败: {}", e),
        }
        self.reporter
            .report(
                ErrorReport::new(ErrorCategory::System, ErrorSeverity::Critical, "处理变更时发生 panic")
                    .with_context(json!({ "mutation_id": id })),
            )
            .await;
    }

    async fn transition(
        &self,
        id: &str,
        from: MutationStatus,
        to: MutationStatus,
        patch: Option<StatusPatch>,
    ) -> Result<Option<MutationRecord>> {
        let updated = self.queue.update_status(id, to, patch).await?;
        if let Some(record) = &updated {
            self.emit_status(id, from, to, record.retry_count).await;
        }
        Ok(updated)
    }

    async fn emit_status(&self, id: &str, from: MutationStatus, to: MutationStatus, retry_count: u32) {
        self.events
            .emit(SyncEvent::MutationStatusChanged {
                id: id.to_string(),
                old_status: from,
                new_status: to,
                retry_count,
                timestamp: TimeFormatter::now_utc_millis(),
            })
            .await;
    }

    fn schedule_retry(&self, id: &str, at: i64) {
        if let Some(sink) = self.retry_sink.lock().as_ref() {
            if sink
                .send(ScheduledRetry {
                    id: id.to_string(),
                    at,
                })
                .is_err()
            {
                debug!("重试调度器已停止，忽略 {}", id);
            }
        }
    }
}

fn mutation_context(record: &MutationRecord) -> serde_json::Value {
    json!({
        "mutation_id": record.id,
        "collection": record.collection,
        "kind": record.kind.to_string(),
        "retry_count": record.retry_count,
    })
}
