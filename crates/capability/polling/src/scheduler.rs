//! 轮询调度器
//!
//! 每个采样器对应一个后台任务。连续错误计数由调度器持有，
//! 成功即清零，达到上限时先把采样器移出调度表，再通知采样器 `error(.., false)`。

use crate::error::SamplerError;
use crate::sampler::{Sampler, SamplerState, ScheduleMode, TickContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 默认停止等待上限。
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 调度器配置。
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `stop_polling` 等待在途采集的上限，超时后强制中止
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

struct Job {
    adapter_id: String,
    sampler: Arc<dyn Sampler>,
    cancel: watch::Sender<bool>,
    errors: Arc<AtomicU32>,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    jobs: Mutex<HashMap<String, Job>>,
}

impl SchedulerInner {
    fn remove(&self, sampler_id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(sampler_id)
    }
}

/// 跨适配器共享的轮询调度器。
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl PollingScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 注册并开始周期触发；同一采样器 ID 重复注册或周期为 0 时返回 false。
    pub fn schedule_polling(&self, sampler: Arc<dyn Sampler>) -> bool {
        let mut jobs = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if jobs.contains_key(sampler.id()) {
            debug!(
                target: "edge.polling",
                sampler_id = %sampler.id(),
                "sampler_already_scheduled"
            );
            return false;
        }
        if sampler.config().period.is_zero() {
            warn!(
                target: "edge.polling",
                sampler_id = %sampler.id(),
                "sampler_period_invalid"
            );
            return false;
        }
        if !sampler.lifecycle().transition(SamplerState::Scheduled) {
            warn!(
                target: "edge.polling",
                sampler_id = %sampler.id(),
                "sampler_closed_not_scheduled"
            );
            return false;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let errors = Arc::new(AtomicU32::new(0));
        let runtime = JobRuntime {
            scheduler: Arc::downgrade(&self.inner),
            sampler: sampler.clone(),
            errors: errors.clone(),
            cancel: cancel_rx,
            sequence: Arc::new(AtomicU64::new(0)),
        };
        let handle = tokio::spawn(runtime.run());
        info!(
            target: "edge.polling",
            adapter_id = %sampler.adapter_id(),
            sampler_id = %sampler.id(),
            period_ms = sampler.config().period.as_millis() as u64,
            schedule = ?sampler.config().schedule,
            "sampler_scheduled"
        );
        jobs.insert(
            sampler.id().to_string(),
            Job {
                adapter_id: sampler.adapter_id().to_string(),
                sampler,
                cancel,
                errors,
                handle,
            },
        );
        true
    }

    /// 取消采样器；等待在途采集结束（有上限）后关闭采样器。
    ///
    /// 采样器不在调度表中时返回 false。
    pub async fn stop_polling(&self, sampler_id: &str) -> bool {
        let Some(mut job) = self.inner.remove(sampler_id) else {
            return false;
        };
        let _ = job.cancel.send(true);
        if tokio::time::timeout(self.inner.config.stop_timeout, &mut job.handle)
            .await
            .is_err()
        {
            warn!(
                target: "edge.polling",
                sampler_id = %sampler_id,
                timeout_ms = self.inner.config.stop_timeout.as_millis() as u64,
                "sampler_stop_timeout_aborted"
            );
            job.handle.abort();
        }
        job.sampler.lifecycle().transition(SamplerState::Closed);
        job.sampler.close().await;
        info!(
            target: "edge.polling",
            adapter_id = %job.adapter_id,
            sampler_id = %sampler_id,
            "sampler_stopped"
        );
        true
    }

    /// 某个适配器当前在调度中的采样器。
    pub fn jobs_for_adapter(&self, adapter_id: &str) -> Vec<Arc<dyn Sampler>> {
        let jobs = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.values()
            .filter(|job| job.adapter_id == adapter_id)
            .map(|job| job.sampler.clone())
            .collect()
    }

    /// 停止某个适配器的全部采样器，返回停止的数量。
    pub async fn stop_adapter(&self, adapter_id: &str) -> usize {
        let mut stopped = 0;
        for sampler in self.jobs_for_adapter(adapter_id) {
            if self.stop_polling(sampler.id()).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// 停止全部采样器。
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let jobs = self
                .inner
                .jobs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            jobs.keys().cloned().collect()
        };
        for id in ids {
            self.stop_polling(&id).await;
        }
    }

    pub fn is_scheduled(&self, sampler_id: &str) -> bool {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(sampler_id)
    }

    /// 当前连续错误数（未调度时为 None）。
    pub fn consecutive_errors(&self, sampler_id: &str) -> Option<u32> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(sampler_id)
            .map(|job| job.errors.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickFlow {
    Continue,
    Stop,
}

/// 单个采样器的后台任务状态。
#[derive(Clone)]
struct JobRuntime {
    scheduler: Weak<SchedulerInner>,
    sampler: Arc<dyn Sampler>,
    errors: Arc<AtomicU32>,
    cancel: watch::Receiver<bool>,
    sequence: Arc<AtomicU64>,
}

impl JobRuntime {
    async fn run(self) {
        let config = self.sampler.config().clone();
        let mut cancel = self.cancel.clone();
        let start_delay = config.start_delay(self.sampler.id());
        if !start_delay.is_zero() && !sleep_or_cancel(start_delay, &mut cancel).await {
            return;
        }

        match config.schedule {
            ScheduleMode::FixedDelay => loop {
                if self.tick().await == TickFlow::Stop {
                    return;
                }
                if !sleep_or_cancel(config.period, &mut cancel).await {
                    return;
                }
            },
            ScheduleMode::FixedRate => {
                let mut ticker = tokio::time::interval(config.period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut inflight = JoinSet::new();
                loop {
                    tokio::select! {
                        _ = wait_cancelled(&mut cancel) => break,
                        _ = ticker.tick() => {
                            let runtime = self.clone();
                            inflight.spawn(async move { runtime.tick().await });
                        }
                        Some(joined) = inflight.join_next() => {
                            if matches!(joined, Ok(TickFlow::Stop)) {
                                break;
                            }
                        }
                    }
                }
                // 等待在途采集结束，超时由 stop_polling 兜底
                while inflight.join_next().await.is_some() {}
            }
        }
    }

    async fn tick(&self) -> TickFlow {
        if *self.cancel.borrow() {
            return TickFlow::Stop;
        }
        let ctx = TickContext::new(
            self.cancel.clone(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        self.sampler.lifecycle().transition(SamplerState::Running);
        let result = self.sampler.execute(&ctx).await;
        self.sampler.lifecycle().transition(SamplerState::Scheduled);

        // 停止期间完成的采集不参与错误统计
        if *self.cancel.borrow() {
            return TickFlow::Stop;
        }

        match result {
            Ok(()) => {
                self.errors.store(0, Ordering::Release);
                TickFlow::Continue
            }
            Err(SamplerError::Cancelled) => TickFlow::Stop,
            Err(err) => {
                let count = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
                if self.sampler.config().should_evict(count) {
                    self.evict(err, count).await;
                    TickFlow::Stop
                } else {
                    debug!(
                        target: "edge.polling",
                        sampler_id = %self.sampler.id(),
                        consecutive_errors = count,
                        error = %err,
                        "sampler_tick_failed"
                    );
                    self.sampler.error(&err, true).await;
                    TickFlow::Continue
                }
            }
        }
    }

    async fn evict(&self, err: SamplerError, count: u32) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        // 已被并发的 stop_polling 移除时由其负责关闭
        let Some(job) = scheduler.remove(self.sampler.id()) else {
            return;
        };
        let _ = job.cancel.send(true);
        warn!(
            target: "edge.polling",
            adapter_id = %self.sampler.adapter_id(),
            sampler_id = %self.sampler.id(),
            consecutive_errors = count,
            error = %err,
            "sampler_evicted"
        );
        self.sampler.error(&err, false).await;
        self.sampler.lifecycle().transition(SamplerState::Closed);
        self.sampler.close().await;
    }
}

/// 睡眠指定时长；期间收到停止信号返回 false。
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_cancelled(cancel) => false,
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
