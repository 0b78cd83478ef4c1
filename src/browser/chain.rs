//! 定位器链：按优先级依次尝试的一组定位器
//!
//! 目标站点的 DOM 结构经常变化，链中的定位器是配置数据，按顺序尝试，第一个命中者胜出。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::session::{AutomationSession, ElementRef, Locator, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocatorChain(Vec<Locator>);

impl LocatorChain {
    pub fn new(locators: Vec<Locator>) -> Self {
        Self(locators)
    }

    pub fn from_strs(raw: &[&str]) -> Self {
        Self(raw.iter().map(|s| Locator::parse(s)).collect())
    }

    pub fn locators(&self) -> &[Locator] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 第一个有匹配的定位器及其首个元素
    ///
    /// 单个定位器的查找错误按未命中处理并继续尝试下一个；
    /// 只有全部定位器都出错时才返回最后一个错误。
    pub async fn first_match(
        &self,
        session: &dyn AutomationSession,
    ) -> Result<Option<(ElementRef, &Locator)>, SessionError> {
        let mut last_err = None;
        let mut any_ok = false;
        for locator in &self.0 {
            match session.find(locator).await {
                Ok(Some(el)) => return Ok(Some((el, locator))),
                Ok(None) => any_ok = true,
                Err(e) => {
                    tracing::debug!(locator = %locator, error = %e, "locator lookup failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if !any_ok => Err(e),
            _ => Ok(None),
        }
    }

    /// 第一个可见且可用的匹配；单个定位器的查找错误按未命中处理
    pub async fn first_interactable(
        &self,
        session: &dyn AutomationSession,
    ) -> Option<(ElementRef, &Locator)> {
        for locator in &self.0 {
            let Ok(found) = session.find_all(locator).await else {
                continue;
            };
            for el in found {
                if session.is_interactable(&el).await.unwrap_or(false) {
                    return Some((el, locator));
                }
            }
        }
        None
    }

    /// 第一个读出非空文本的匹配
    pub async fn first_text(
        &self,
        session: &dyn AutomationSession,
    ) -> Option<(String, &Locator)> {
        for locator in &self.0 {
            let Ok(Some(el)) = session.find(locator).await else {
                continue;
            };
            if let Ok(text) = session.read_text(&el).await {
                let text = text.trim();
                if !text.is_empty() {
                    return Some((text.to_string(), locator));
                }
            }
        }
        None
    }

    /// 是否有任一定位器匹配到至少 `min` 个元素
    pub async fn any_reaches(&self, session: &dyn AutomationSession, min: usize) -> bool {
        for locator in &self.0 {
            if let Ok(found) = session.find_all(locator).await {
                if found.len() >= min {
                    return true;
                }
            }
        }
        false
    }

    /// 轮询直到链中任一定位器命中，超时返回 None；零超时只检查一次
    pub async fn wait_first_match(
        &self,
        session: &dyn AutomationSession,
        timeout: Duration,
    ) -> Option<(ElementRef, &Locator)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(found)) = self.first_match(session).await {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// 替换链中每个定位器的模板占位符
    pub fn render(&self, key: &str, value: &str) -> Self {
        Self(self.0.iter().map(|l| l.render(key, value)).collect())
    }
}

impl From<Vec<&str>> for LocatorChain {
    fn from(raw: Vec<&str>) -> Self {
        Self::from_strs(&raw)
    }
}
