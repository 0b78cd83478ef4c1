//! 作业监管：每类作业（抓取 / 外联）进程内至多一个在运行
//!
//! 启动前先抢占运行权（CAS），已有作业时直接拒绝而不是排队；
//! 每个作业在一个后台任务中运行，通过 StatusCell 发布快照，通过 CancellationToken 协作取消。
//! 作业内部 panic 会被捕获并写入终态快照，运行权随之释放。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::JobError;
use crate::core::state::{CampaignState, ScrapeStatus, StatusCell};

/// 可作为作业状态的快照类型
pub trait JobSnapshot: Clone + Send + Sync + 'static {
    /// 作业异常终止时的终态（保留已有的部分计数）
    fn crashed(self, reason: String) -> Self;
}

impl JobSnapshot for ScrapeStatus {
    fn crashed(mut self, reason: String) -> Self {
        self.running = false;
        self.message = format!("Error during scraping: {}", reason);
        self.errors.push(reason);
        self
    }
}

impl JobSnapshot for CampaignState {
    fn crashed(mut self, reason: String) -> Self {
        self.running = false;
        self.message = format!("Campaign error: {}", reason);
        self.errors.push(reason);
        self
    }
}

/// 单类作业的槽位：运行标志 + 取消令牌 + 状态单元
pub struct JobSlot<S> {
    kind: &'static str,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    status: StatusCell<S>,
}

impl<S: JobSnapshot> JobSlot<S> {
    pub fn new(kind: &'static str, initial: S) -> Arc<Self> {
        Arc::new(Self {
            kind,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            status: StatusCell::new(initial),
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> &StatusCell<S> {
        &self.status
    }

    pub fn snapshot(&self) -> S {
        self.status.snapshot()
    }

    /// 抢占运行权并发布初始快照；已在运行时返回 AlreadyRunning
    pub fn try_begin(self: &Arc<Self>, initial: S) -> Result<JobLease<S>, JobError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| JobError::AlreadyRunning(self.kind))?;

        let token = CancellationToken::new();
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = token.clone();
        }
        self.status.replace(initial);
        Ok(JobLease {
            slot: Arc::clone(self),
            token,
        })
    }

    /// 请求停止当前作业（协作式：在下一个工作单元边界生效）
    pub fn stop(&self) -> Result<(), JobError> {
        if !self.is_running() {
            return Err(JobError::NotRunning(self.kind));
        }
        if let Ok(guard) = self.cancel.lock() {
            guard.cancel();
        }
        tracing::info!(kind = self.kind, "stop requested");
        Ok(())
    }

    /// 抢占运行权后在后台任务中执行作业；作业返回值作为终态快照发布
    pub fn spawn<F, Fut>(self: &Arc<Self>, initial: S, job: F) -> Result<JoinHandle<()>, JobError>
    where
        F: FnOnce(CancellationToken, StatusCell<S>) -> Fut,
        Fut: Future<Output = S> + Send + 'static,
    {
        let lease = self.try_begin(initial)?;
        let inner = tokio::spawn(job(lease.token(), lease.status()));
        let kind = self.kind;

        Ok(tokio::spawn(async move {
            let status = lease.status();
            match inner.await {
                Ok(terminal) => status.replace(terminal),
                Err(e) => {
                    tracing::error!(kind, error = %e, "job task aborted");
                    let last = status.snapshot();
                    status.replace(last.crashed(e.to_string()));
                }
            }
            drop(lease);
        }))
    }
}

/// 运行权租约：Drop 时释放运行标志
pub struct JobLease<S> {
    slot: Arc<JobSlot<S>>,
    token: CancellationToken,
}

impl<S: JobSnapshot> JobLease<S> {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn status(&self) -> StatusCell<S> {
        self.slot.status.clone()
    }
}

impl<S> Drop for JobLease<S> {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::SeqCst);
    }
}

/// 进程级作业监管：抓取与外联各一个槽位
#[derive(Clone)]
pub struct JobSupervisor {
    pub scrape: Arc<JobSlot<ScrapeStatus>>,
    pub campaign: Arc<JobSlot<CampaignState>>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self {
            scrape: JobSlot::new("scraping", ScrapeStatus::default()),
            campaign: JobSlot::new("campaign", CampaignState::idle()),
        }
    }
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
