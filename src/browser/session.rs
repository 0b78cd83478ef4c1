//! 自动化会话抽象：定位器、元素引用、交互动作
//!
//! 元素引用不持有活的 DOM 句柄，而是一条「定位器 + 序号」路径，每次操作时重新解析，
//! 因此页面重排后旧引用要么解析到当前位置的元素，要么报 NotFound / Stale，不会悬空。

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 会话错误（定位失败、元素过期、点击被拦截、超时等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Stale element: {0}")]
    Stale(String),

    #[error("Click intercepted: {0}")]
    Intercepted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported locator: {0}")]
    Unsupported(String),

    #[error("Browser error: {0}")]
    Other(String),
}

impl SessionError {
    /// 重试可能成功的错误（元素过期 / 被遮挡）
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Stale(_) | Self::Intercepted(_))
    }
}

/// 定位器：CSS 或 XPath
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn xpath(path: impl Into<String>) -> Self {
        Self::XPath(path.into())
    }

    /// `xpath:` 前缀或以 `/` 开头视为 XPath，其余为 CSS
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("xpath:") {
            Self::XPath(rest.trim().to_string())
        } else if raw.starts_with('/') {
            Self::XPath(raw.to_string())
        } else {
            Self::Css(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Css(s) | Self::XPath(s) => s,
        }
    }

    /// 替换模板占位符，如 `{query}`
    pub fn render(&self, key: &str, value: &str) -> Self {
        let placeholder = format!("{{{}}}", key);
        match self {
            Self::Css(s) => Self::Css(s.replace(&placeholder, value)),
            Self::XPath(s) => Self::XPath(s.replace(&placeholder, value)),
        }
    }
}

impl From<String> for Locator {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for Locator {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<Locator> for String {
    fn from(loc: Locator) -> Self {
        match loc {
            Locator::Css(s) => s,
            Locator::XPath(s) => format!("xpath:{}", s),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={}", s),
            Self::XPath(s) => write!(f, "xpath={}", s),
        }
    }
}

/// 元素引用：从页面根开始的（定位器, 序号）路径
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef {
    steps: Vec<(Locator, usize)>,
}

impl ElementRef {
    pub fn root(locator: Locator, index: usize) -> Self {
        Self {
            steps: vec![(locator, index)],
        }
    }

    pub fn child(&self, locator: Locator, index: usize) -> Self {
        let mut steps = self.steps.clone();
        steps.push((locator, index));
        Self { steps }
    }

    pub fn steps(&self) -> &[(Locator, usize)] {
        &self.steps
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .steps
            .iter()
            .map(|(l, i)| format!("{}[{}]", l, i))
            .collect();
        f.write_str(&parts.join(" > "))
    }
}

/// 交互动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// 模拟指针点击
    Click,
    /// 脚本触发 click()（比指针点击更可靠，不受遮挡影响）
    ScriptClick,
    ScrollIntoView,
    Focus,
    Clear,
    Type(String),
    PressEnter,
    PageDown,
}

/// 自动化会话：导航、查找、交互、读取
///
/// 同一会话只能被一个任务顺序驱动；实现方负责把阻塞调用挪出异步运行时。
#[async_trait]
pub trait AutomationSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    /// 页面根下所有匹配
    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, SessionError>;

    /// 某元素内部的所有匹配
    async fn find_within(
        &self,
        parent: &ElementRef,
        locator: &Locator,
    ) -> Result<Vec<ElementRef>, SessionError>;

    async fn interact(&self, target: &ElementRef, action: Action) -> Result<(), SessionError>;

    async fn read_text(&self, target: &ElementRef) -> Result<String, SessionError>;

    async fn read_attribute(
        &self,
        target: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    /// 可见且可用
    async fn is_interactable(&self, target: &ElementRef) -> Result<bool, SessionError>;

    /// 页面源码（用于检测列表结束标记）
    async fn page_source(&self) -> Result<String, SessionError>;

    /// 页面可见文本
    async fn page_text(&self) -> Result<String, SessionError>;

    async fn find(&self, locator: &Locator) -> Result<Option<ElementRef>, SessionError> {
        Ok(self.find_all(locator).await?.into_iter().next())
    }

    /// 翻页 / 滚动信号：有容器时对容器发送 PageDown
    async fn scroll_signal(&self, container: Option<&ElementRef>) -> Result<(), SessionError> {
        match container {
            Some(c) => self.interact(c, Action::PageDown).await,
            None => Ok(()),
        }
    }

    /// 轮询等待元素出现，超时返回 None
    async fn wait_for(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Option<ElementRef>, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.find(locator).await? {
                return Ok(Some(found));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parse() {
        assert_eq!(Locator::parse("div.Nv2PK"), Locator::css("div.Nv2PK"));
        assert_eq!(Locator::parse("/html/body/button"), Locator::xpath("/html/body/button"));
        assert_eq!(Locator::parse("xpath: //button[1]"), Locator::xpath("//button[1]"));
        let s: String = Locator::xpath("//a").into();
        assert_eq!(Locator::from(s), Locator::xpath("//a"));
    }

    #[test]
    fn test_locator_render_template() {
        let loc = Locator::css("div[aria-label='Results for {query}']");
        assert_eq!(
            loc.render("query", "coffee in austin"),
            Locator::css("div[aria-label='Results for coffee in austin']")
        );
    }

    #[test]
    fn test_element_ref_child_path() {
        let item = ElementRef::root(Locator::css("div.Nv2PK"), 3);
        let link = item.child(Locator::css("a"), 0);
        assert_eq!(link.steps().len(), 2);
        assert_eq!(link.to_string(), "css=div.Nv2PK[3] > css=a[0]");
    }
}
