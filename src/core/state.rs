//! 状态快照：ScrapeStatus / CampaignState 与发布通道
//!
//! 后台任务是唯一写者，每次以整份快照原子替换（watch::send_replace）；
//! 状态查询端只读最新快照，不需要细粒度锁。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

/// 抓取作业的可轮询状态
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ScrapeStatus {
    pub job_id: Option<String>,
    pub running: bool,
    pub progress: u8,
    pub message: String,
    pub total_found: usize,
    pub scraped_count: usize,
    pub enriched_count: usize,
    pub output: Option<PathBuf>,
    pub errors: Vec<String>,
}

impl ScrapeStatus {
    pub fn starting(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            running: true,
            message: "Initializing scraper...".to_string(),
            ..Self::default()
        }
    }
}

/// 外联活动状态：整个运行期间唯一的可变对象
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CampaignState {
    pub running: bool,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub progress_percent: u8,
    pub message: String,
    /// 有序、只追加
    pub errors: Vec<String>,
}

impl CampaignState {
    pub fn starting() -> Self {
        Self {
            running: true,
            message: "Starting campaign...".to_string(),
            ..Self::default()
        }
    }

    pub fn idle() -> Self {
        Self {
            message: "No campaign running".to_string(),
            ..Self::default()
        }
    }

    pub fn completed(&self) -> usize {
        self.sent + self.failed
    }
}

/// 快照接收方
pub trait StatusSink<S>: Send + Sync {
    fn publish(&self, snapshot: S);
}

/// 基于 watch 通道的状态单元：publish 即整份替换
#[derive(Clone)]
pub struct StatusCell<S> {
    tx: Arc<watch::Sender<S>>,
}

impl<S: Clone + Send + Sync + 'static> StatusCell<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// 当前快照（克隆）
    pub fn snapshot(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    pub fn replace(&self, snapshot: S) {
        self.tx.send_replace(snapshot);
    }
}

impl<S: Clone + Send + Sync + 'static> StatusSink<S> for StatusCell<S> {
    fn publish(&self, snapshot: S) {
        self.replace(snapshot);
    }
}

/// 记录全部快照（测试与离线回放用）
pub struct RecordingSink<S> {
    snapshots: Mutex<Vec<S>>,
}

impl<S: Clone> RecordingSink<S> {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshots(&self) -> Vec<S> {
        self.snapshots
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

impl<S: Clone + Send> StatusSink<S> for RecordingSink<S> {
    fn publish(&self, snapshot: S) {
        if let Ok(mut g) = self.snapshots.lock() {
            g.push(snapshot);
        }
    }
}

/// 丢弃所有快照
pub struct NullSink;

impl<S> StatusSink<S> for NullSink {
    fn publish(&self, _snapshot: S) {}
}
