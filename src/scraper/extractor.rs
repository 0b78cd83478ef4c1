//! 详情抽取：逐条激活列表条目并读取五个字段
//!
//! 每轮重新解析条目位置（页面会重排）；按链接 href 去重，保留首次出现；
//! 激活失败跳过该条目，字段失败只把该字段降级为 "N/A"。

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::browser::{Action, AutomationSession, ElementRef, LocatorChain, SessionError};
use crate::config::ScraperConfig;
use crate::dataset::{Record, NOT_AVAILABLE};

/// 单个字段的抽取结果，在记录边界折叠为字符串
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Present(String),
    Unavailable(String),
}

impl FieldValue {
    fn from_text(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            Self::Unavailable("empty text".to_string())
        } else {
            Self::Present(text.to_string())
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    fn collapse(self, field: &str) -> String {
        match self {
            Self::Present(v) => v,
            Self::Unavailable(reason) => {
                tracing::debug!(field, reason = %reason, "field unavailable");
                NOT_AVAILABLE.to_string()
            }
        }
    }
}

fn review_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+(?:,\d+)*)\)").expect("static regex"))
}

/// 评分组合：评分值 + 评论数 → 单独其一 → 评分块全文
pub fn compose_rating(value: Option<&str>, reviews: Option<&str>, block_text: &str) -> FieldValue {
    let reviews = reviews.map(str::to_string).or_else(|| {
        review_count_re()
            .captures(block_text)
            .map(|c| format!("({})", &c[1]))
    });
    match (value, reviews) {
        (Some(v), Some(r)) => FieldValue::Present(format!("{} {}", v, r)),
        (Some(v), None) => FieldValue::Present(v.to_string()),
        (None, Some(r)) => FieldValue::Present(r),
        (None, None) => FieldValue::from_text(block_text),
    }
}

/// 抽取结果
#[derive(Debug, Clone, Default)]
pub struct ExtractOutcome {
    pub records: Vec<Record>,
    pub duplicates: usize,
    /// 激活失败或没有链接而跳过的条目
    pub skipped: usize,
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

pub struct RecordExtractor<'a> {
    session: &'a dyn AutomationSession,
    config: &'a ScraperConfig,
}

impl<'a> RecordExtractor<'a> {
    pub fn new(session: &'a dyn AutomationSession, config: &'a ScraperConfig) -> Self {
        Self { session, config }
    }

    /// 抽取至多 `target` 条；`progress(done, target)` 在每条记录追加后调用
    pub async fn run(
        &self,
        target: usize,
        cancel: &CancellationToken,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> ExtractOutcome {
        tracing::info!(target, "starting to scrape results");
        pause(self.config.list_settle_ms).await;

        let mut out = ExtractOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for i in 0..target {
            if cancel.is_cancelled() {
                tracing::info!(done = out.records.len(), "extraction cancelled");
                break;
            }

            let items = self.items().await;
            let Some(item) = items.get(i) else {
                tracing::warn!(index = i + 1, available = items.len(), "result no longer available, stopping");
                break;
            };
            tracing::debug!(index = i + 1, target, "processing result");

            let anchor = match self.session.find_within(item, &self.config.anchor_locator).await {
                Ok(found) if !found.is_empty() => found[0].clone(),
                _ => {
                    tracing::warn!(index = i + 1, "no clickable element in result");
                    out.skipped += 1;
                    continue;
                }
            };

            match self.session.read_attribute(&anchor, "href").await {
                Ok(Some(href)) => {
                    if !seen.insert(href) {
                        tracing::debug!(index = i + 1, "skipping duplicate result");
                        out.duplicates += 1;
                        continue;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(index = i + 1, error = %e, "href unreadable, dedup disabled for item"),
            }

            if let Err(e) = self.activate(&anchor).await {
                tracing::warn!(index = i + 1, error = %e, "failed to activate result, skipping");
                out.skipped += 1;
                continue;
            }

            let record = self.extract_record().await;
            tracing::info!(index = i + 1, title = %record.title, "extracted place");
            out.records.push(record);
            progress(out.records.len(), target);

            pause(self.config.item_pause_ms).await;
        }

        tracing::info!(
            extracted = out.records.len(),
            duplicates = out.duplicates,
            skipped = out.skipped,
            "scraping completed"
        );
        out
    }

    /// 当前页面上的条目（第一个有匹配的条目定位器）
    async fn items(&self) -> Vec<ElementRef> {
        for locator in self.config.item_locators.locators() {
            if let Ok(found) = self.session.find_all(locator).await {
                if !found.is_empty() {
                    return found;
                }
            }
        }
        Vec::new()
    }

    /// 滚动到可见后点击；过期 / 被遮挡时有限次重试，其他错误立即放弃
    async fn activate(&self, target: &ElementRef) -> Result<(), SessionError> {
        let max = self.config.max_click_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.click(target).await {
                Ok(()) => {
                    pause(self.config.after_click_ms).await;
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < max => {
                    tracing::debug!(attempt, error = %e, "click attempt failed, retrying");
                    pause(self.config.retry_pause_ms).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn click(&self, target: &ElementRef) -> Result<(), SessionError> {
        self.session.interact(target, Action::ScrollIntoView).await?;
        pause(self.config.click_pause_ms).await;
        self.session.interact(target, Action::Click).await
    }

    /// 读取详情面板的五个字段，各自独立降级
    pub async fn extract_record(&self) -> Record {
        let fields = &self.config.fields;
        if fields
            .title
            .wait_first_match(
                self.session,
                Duration::from_millis(self.config.detail_timeout_ms),
            )
            .await
            .is_none()
        {
            tracing::warn!("place details didn't load in time");
        }

        Record {
            title: self.field(&fields.title).await.collapse("title"),
            rating_display: self.rating().await.collapse("rating"),
            address: self.field(&fields.address).await.collapse("address"),
            website: self.field(&fields.website).await.collapse("website"),
            phone: self.field(&fields.phone).await.collapse("phone"),
        }
    }

    async fn field(&self, chain: &LocatorChain) -> FieldValue {
        match chain.first_match(self.session).await {
            Ok(Some((el, _))) => match self.session.read_text(&el).await {
                Ok(text) => FieldValue::from_text(&text),
                Err(e) => FieldValue::Unavailable(e.to_string()),
            },
            Ok(None) => FieldValue::Unavailable("not found".to_string()),
            Err(e) => FieldValue::Unavailable(e.to_string()),
        }
    }

    async fn rating(&self) -> FieldValue {
        let fields = &self.config.fields;
        let block = match fields.rating_block.first_match(self.session).await {
            Ok(Some((el, _))) => el,
            Ok(None) => return FieldValue::Unavailable("rating block not found".to_string()),
            Err(e) => return FieldValue::Unavailable(e.to_string()),
        };
        let value = self.text_within(&block, &fields.rating_value).await;
        let reviews = self.text_within(&block, &fields.review_count).await;
        let block_text = self.session.read_text(&block).await.unwrap_or_default();
        compose_rating(value.as_deref(), reviews.as_deref(), &block_text)
    }

    async fn text_within(&self, parent: &ElementRef, chain: &LocatorChain) -> Option<String> {
        for locator in chain.locators() {
            let Ok(found) = self.session.find_within(parent, locator).await else {
                continue;
            };
            let Some(el) = found.first() else {
                continue;
            };
            if let Ok(text) = self.session.read_text(el).await {
                let text = text.trim();
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Effect, FakeElement, Locator, ScriptedSession};

    const TITLE: &str = "h1.DUwDvf.lfPIob";
    const RATING: &str = "div.F7nice";
    const ADDRESS: &str = "div.Io6YTe.fontBodyMedium.kR99db.fdkmkc";
    const WEBSITE: &str = "div.rogA2c.ITvuef";
    const PHONE: &str = r#"button[data-item-id^="phone"] .Io6YTe"#;

    #[derive(Default)]
    struct Place {
        title: Option<&'static str>,
        rating: Option<FakeElement>,
        address: Option<&'static str>,
        website: Option<&'static str>,
        phone: Option<&'static str>,
    }

    fn install(locator: &str, text: Option<&str>) -> Effect {
        Effect::Install {
            locator: Locator::css(locator),
            elements: text.map(FakeElement::new).into_iter().collect(),
        }
    }

    fn item(href: Option<&str>, place: Place) -> FakeElement {
        let mut link = FakeElement::new("")
            .on_activate(install(TITLE, place.title))
            .on_activate(Effect::Install {
                locator: Locator::css(RATING),
                elements: place.rating.into_iter().collect(),
            })
            .on_activate(install(ADDRESS, place.address))
            .on_activate(install(WEBSITE, place.website))
            .on_activate(install(PHONE, place.phone));
        if let Some(href) = href {
            link = link.attr("href", href);
        }
        FakeElement::new("").child("a", link)
    }

    fn titled(title: &'static str) -> Place {
        Place {
            title: Some(title),
            ..Place::default()
        }
    }

    fn rating_block(value: &str, reviews: &str) -> FakeElement {
        FakeElement::new(format!("{}({})", value, reviews))
            .child(r#"span[aria-hidden="true"]"#, FakeElement::new(value))
            .child(r#"span[aria-label*="reviews"]"#, FakeElement::new(format!("({})", reviews)))
    }

    async fn extract(session: &ScriptedSession, config: &ScraperConfig, target: usize) -> ExtractOutcome {
        RecordExtractor::new(session, config)
            .run(target, &CancellationToken::new(), &mut |_, _| {})
            .await
    }

    #[tokio::test]
    async fn test_duplicate_identity_keeps_first() {
        let config = ScraperConfig::default().without_pauses();
        let session = ScriptedSession::new().with_elements(
            "div.Nv2PK",
            vec![
                item(Some("/place/1"), titled("R1")),
                item(Some("/place/1"), titled("R2")),
                item(Some("/place/3"), titled("R3")),
            ],
        );
        let out = extract(&session, &config, 3).await;

        let titles: Vec<_> = out.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["R1", "R3"]);
        assert_eq!(out.duplicates, 1);
    }

    #[tokio::test]
    async fn test_missing_href_disables_dedup() {
        let config = ScraperConfig::default().without_pauses();
        let session = ScriptedSession::new().with_elements(
            "div.Nv2PK",
            vec![item(None, titled("A")), item(None, titled("B"))],
        );
        let out = extract(&session, &config, 2).await;
        assert_eq!(out.records.len(), 2);
    }

    #[tokio::test]
    async fn test_address_falls_back_past_broken_locator() {
        let config = ScraperConfig::default().without_pauses();
        let link = FakeElement::new("")
            .attr("href", "/place/1")
            .on_activate(install(TITLE, Some("Corner Deli")))
            .on_activate(install(
                r#"button[data-item-id="address"] .Io6YTe"#,
                Some("9 Elm St"),
            ));
        let session = ScriptedSession::new()
            .with_broken_locator(ADDRESS, "invalid selector")
            .with_elements("div.Nv2PK", vec![FakeElement::new("").child("a", link)]);
        let out = extract(&session, &config, 1).await;

        assert_eq!(out.records[0].title, "Corner Deli");
        assert_eq!(out.records[0].address, "9 Elm St");
    }

    #[tokio::test]
    async fn test_fields_degrade_independently() {
        let config = ScraperConfig::default().without_pauses();
        let session = ScriptedSession::new().with_elements(
            "div.Nv2PK",
            vec![
                item(
                    Some("/place/1"),
                    Place {
                        title: Some("Joe's Cafe"),
                        rating: Some(rating_block("4.5", "1,204")),
                        address: Some("1 Main St"),
                        website: Some("joescafe.com"),
                        phone: Some("(555) 010-0000"),
                    },
                ),
                item(
                    Some("/place/2"),
                    Place {
                        title: Some("Quiet Spot"),
                        phone: Some("555-0101"),
                        ..Place::default()
                    },
                ),
            ],
        );
        let out = extract(&session, &config, 2).await;

        let joes = &out.records[0];
        assert_eq!(joes.rating_display, "4.5 (1,204)");
        assert_eq!(joes.website, "joescafe.com");

        let quiet = &out.records[1];
        assert_eq!(quiet.title, "Quiet Spot");
        assert_eq!(quiet.rating_display, "N/A");
        assert_eq!(quiet.address, "N/A");
        assert_eq!(quiet.website, "N/A");
        assert_eq!(quiet.phone, "555-0101");
    }

    #[tokio::test]
    async fn test_click_retries_then_skips() {
        let config = ScraperConfig::default().without_pauses();
        let mut flaky_once = item(Some("/place/1"), titled("Eventually"));
        flaky_once.children[0].1.flaky_clicks = 2;
        let mut never = item(Some("/place/2"), titled("Never"));
        never.children[0].1.flaky_clicks = 3;
        let session = ScriptedSession::new()
            .with_elements("div.Nv2PK", vec![flaky_once, never, item(Some("/place/3"), titled("After"))]);

        let out = extract(&session, &config, 3).await;

        let titles: Vec<_> = out.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Eventually", "After"]);
        assert_eq!(out.skipped, 1);
        let clicks = session
            .actions()
            .iter()
            .filter(|a| a.starts_with("click css=div.Nv2PK[1]"))
            .count();
        assert_eq!(clicks, 3);
    }

    #[tokio::test]
    async fn test_stops_when_items_run_out() {
        let config = ScraperConfig::default().without_pauses();
        let session = ScriptedSession::new()
            .with_elements("div.Nv2PK", vec![item(Some("/a"), titled("A")), item(Some("/b"), titled("B"))]);
        let mut calls = Vec::new();
        let out = RecordExtractor::new(&session, &config)
            .run(5, &CancellationToken::new(), &mut |done, total| calls.push((done, total)))
            .await;

        assert_eq!(out.records.len(), 2);
        assert_eq!(calls, vec![(1, 5), (2, 5)]);
    }

    #[tokio::test]
    async fn test_item_without_anchor_skipped() {
        let config = ScraperConfig::default().without_pauses();
        let session = ScriptedSession::new().with_elements(
            "div.Nv2PK",
            vec![FakeElement::new("ad"), item(Some("/a"), titled("A"))],
        );
        let out = extract(&session, &config, 2).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.skipped, 1);
    }

    #[test]
    fn test_compose_rating_fallbacks() {
        assert_eq!(
            compose_rating(Some("4.2"), None, "4.2(3,001)"),
            FieldValue::Present("4.2 (3,001)".into())
        );
        assert_eq!(
            compose_rating(None, Some("(12)"), "whatever"),
            FieldValue::Present("(12)".into())
        );
        assert_eq!(
            compose_rating(None, None, "No reviews"),
            FieldValue::Present("No reviews".into())
        );
        assert!(!compose_rating(None, None, "  ").is_present());
    }
}
