//! 浏览器自动化层
//!
//! - `session`: 会话抽象（定位器、元素路径、动作、错误）
//! - `chain`: 可配置的定位器链
//! - `scripted`: 内存会话（测试 / 演练）
//! - `chrome`: headless_chrome 实现（feature "browser"）

pub mod chain;
#[cfg(feature = "browser")]
pub mod chrome;
pub mod scripted;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;

pub use chain::LocatorChain;
#[cfg(feature = "browser")]
pub use chrome::{ChromeLauncher, ChromeSession};
pub use scripted::{Effect, FakeElement, ScriptedSession};
pub use session::{Action, AutomationSession, ElementRef, Locator, SessionError};

/// 会话启动器：每个抓取作业启动一个会话，作业结束即释放
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn AutomationSession>, SessionError>;
}

/// 总是交出同一个已存在的会话
pub struct SharedLauncher {
    session: Arc<dyn AutomationSession>,
}

impl SharedLauncher {
    pub fn new(session: Arc<dyn AutomationSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SessionLauncher for SharedLauncher {
    async fn launch(&self) -> Result<Arc<dyn AutomationSession>, SessionError> {
        Ok(Arc::clone(&self.session))
    }
}

/// 未编译浏览器支持时的启动器：总是失败
pub struct UnavailableLauncher;

#[async_trait]
impl SessionLauncher for UnavailableLauncher {
    async fn launch(&self) -> Result<Arc<dyn AutomationSession>, SessionError> {
        Err(SessionError::Launch(
            "Browser support not compiled in; rebuild with --features browser".to_string(),
        ))
    }
}
