//! 错误类型
//!
//! 单字段 / 单条目 / 单记录的失败都降级为哨兵值 + 状态标签，不走这里；
//! 这里只收录需要向调用方传播的错误：会话启动失败、作业互斥、存储失败。

use thiserror::Error;

use crate::browser::SessionError;
use crate::dataset::StoreError;

/// 作业监管错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// 同类作业已在运行，新请求直接拒绝（不排队）
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("No {0} is running")]
    NotRunning(&'static str),
}

/// 抓取作业错误：只有会话启动失败是致命的
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Automation session failed to start: {0}")]
    SessionStart(#[source] SessionError),

    #[error("Navigation failed: {0}")]
    Navigation(#[source] SessionError),

    #[error("Dataset store error: {0}")]
    Store(#[from] StoreError),

    #[error("Search query is required")]
    EmptyQuery,
}
