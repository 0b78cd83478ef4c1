//! 结果列表翻页：对列表容器反复发送翻页信号，直到出现结束标记或次数用尽

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::browser::{AutomationSession, ElementRef};
use crate::config::ScraperConfig;

/// 翻页结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingOutcome {
    /// 停止时页面上的条目数（尽力而为）
    pub item_count: usize,
    pub attempts: usize,
    pub reached_end: bool,
}

pub struct ResultLister<'a> {
    session: &'a dyn AutomationSession,
    config: &'a ScraperConfig,
}

impl<'a> ResultLister<'a> {
    pub fn new(session: &'a dyn AutomationSession, config: &'a ScraperConfig) -> Self {
        Self { session, config }
    }

    /// 等待列表容器出现；找不到只记警告
    pub async fn locate_container(&self, query: &str) -> Option<ElementRef> {
        let chain = self.config.container_locators.render("query", query);
        match chain
            .wait_first_match(
                self.session,
                Duration::from_millis(self.config.container_timeout_ms),
            )
            .await
        {
            Some((container, locator)) => {
                tracing::debug!(locator = %locator, "results container found");
                Some(container)
            }
            None => {
                tracing::warn!(query, "could not find results container, continuing anyway");
                None
            }
        }
    }

    /// 翻页直到结束标记出现、次数用尽或被取消，然后统计条目数
    pub async fn run(&self, query: &str, cancel: &CancellationToken) -> ListingOutcome {
        let mut attempts = 0;
        let mut reached_end = false;

        if let Some(container) = self.locate_container(query).await {
            tracing::info!("scrolling to load all results");
            while attempts < self.config.max_scroll_attempts {
                if cancel.is_cancelled() {
                    tracing::info!(attempts, "scrolling cancelled");
                    break;
                }
                self.scroll_once(&container).await;
                attempts += 1;

                if self.end_reached().await {
                    reached_end = true;
                    tracing::info!(attempts, "reached end of results");
                    break;
                }
                if attempts % 10 == 0 {
                    tracing::info!(attempts, "still scrolling");
                }
            }
        }

        let item_count = self.count_items().await;
        tracing::info!(item_count, attempts, reached_end, "listing finished");
        ListingOutcome {
            item_count,
            attempts,
            reached_end,
        }
    }

    /// 一轮：两次翻页信号，各自之后暂停
    async fn scroll_once(&self, container: &ElementRef) {
        for _ in 0..2 {
            if let Err(e) = self.session.scroll_signal(Some(container)).await {
                tracing::debug!(error = %e, "scroll signal failed");
            }
            if self.config.scroll_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.scroll_pause_ms)).await;
            }
        }
    }

    async fn end_reached(&self) -> bool {
        match self.session.page_source().await {
            Ok(html) => html.contains(&self.config.end_marker),
            Err(e) => {
                tracing::debug!(error = %e, "page source unavailable");
                false
            }
        }
    }

    /// 当前条目数：第一个有匹配的条目定位器的匹配数
    pub async fn count_items(&self) -> usize {
        for locator in self.config.item_locators.locators() {
            if let Ok(found) = self.session.find_all(locator).await {
                if !found.is_empty() {
                    return found.len();
                }
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{FakeElement, ScriptedSession};

    const FEED: &str = "div[aria-label='Results for cafes']";

    fn listing(items: usize) -> ScriptedSession {
        ScriptedSession::new()
            .with_element(FEED, FakeElement::new(""))
            .with_elements("div.Nv2PK", vec![FakeElement::new("item"); items])
    }

    #[tokio::test]
    async fn test_stops_when_end_marker_appears() {
        let config = ScraperConfig::default().without_pauses();
        // 每轮两次翻页，第 3 轮结束后出现标记
        let session = listing(7).with_end_marker_after(6, &config.end_marker);
        let out = ResultLister::new(&session, &config)
            .run("cafes", &CancellationToken::new())
            .await;

        assert_eq!(out.attempts, 3);
        assert!(out.reached_end);
        assert_eq!(out.item_count, 7);
        assert_eq!(session.page_downs(), 6);
    }

    #[tokio::test]
    async fn test_attempt_bound_without_marker() {
        let config = ScraperConfig {
            max_scroll_attempts: 4,
            ..ScraperConfig::default().without_pauses()
        };
        let session = listing(2);
        let out = ResultLister::new(&session, &config)
            .run("cafes", &CancellationToken::new())
            .await;

        assert_eq!(out.attempts, 4);
        assert!(!out.reached_end);
        assert_eq!(session.page_downs(), 8);
    }

    #[tokio::test]
    async fn test_missing_container_still_counts() {
        let config = ScraperConfig::default().without_pauses();
        let session = ScriptedSession::new().with_elements("div.Nv2PK", vec![FakeElement::new("x"); 3]);
        let out = ResultLister::new(&session, &config)
            .run("cafes", &CancellationToken::new())
            .await;

        assert_eq!(out.attempts, 0);
        assert_eq!(out.item_count, 3);
        assert_eq!(session.page_downs(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let config = ScraperConfig::default().without_pauses();
        let session = listing(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = ResultLister::new(&session, &config).run("cafes", &cancel).await;
        assert_eq!(out.attempts, 0);
        assert_eq!(out.item_count, 1);
    }
}
