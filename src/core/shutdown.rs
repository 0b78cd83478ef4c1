//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 时触发关闭令牌，并把停止请求转发给正在运行的作业，
//! 让抓取与外联在当前工作单元结束后退出，而不是被直接杀掉。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::jobs::JobSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 进程级关闭令牌
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子令牌：关闭时一并取消
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "shutdown requested, stopping running jobs...");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }

    /// 关闭时向所有正在运行的作业发出停止请求
    pub fn forward_to(self: &Arc<Self>, supervisor: JobSupervisor) {
        let token = self.token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            for result in [supervisor.scrape.stop(), supervisor.campaign.stop()] {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "nothing to stop");
                }
            }
        });
    }
}
