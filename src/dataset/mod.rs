//! 数据模型：Record / EnrichedRecord / Dataset 与哨兵值 "N/A"
//!
//! Record 在列表抓取阶段只读创建；经过一次补全后成为 EnrichedRecord；
//! Dataset 持久化一次，之后可由补全流程原地追加字段（见 store）。

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{DatasetFormat, DatasetStore, StoreError};

/// 哨兵值：字段有意未知 / 缺失
pub const NOT_AVAILABLE: &str = "N/A";

/// 等价于 "N/A" 的短语（小写、去首尾空白后比较）
const SENTINEL_PHRASES: [&str; 4] = ["n/a", "not available", "not found", ""];

/// 将等价短语归一为 "N/A"，其余原样返回；幂等
pub fn normalize_sentinel(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    if SENTINEL_PHRASES.contains(&lowered.as_str()) {
        NOT_AVAILABLE.to_string()
    } else {
        value.to_string()
    }
}

/// 是否为哨兵（或等价短语）
pub fn is_sentinel(value: &str) -> bool {
    normalize_sentinel(value) == NOT_AVAILABLE
}

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// 一条商户列表记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default = "not_available")]
    pub title: String,
    #[serde(rename = "rating_and_reviews", default = "not_available")]
    pub rating_display: String,
    #[serde(default = "not_available")]
    pub address: String,
    #[serde(default = "not_available")]
    pub website: String,
    #[serde(default = "not_available")]
    pub phone: String,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            title: not_available(),
            rating_display: not_available(),
            address: not_available(),
            website: not_available(),
            phone: not_available(),
        }
    }
}

/// 补全结果状态（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    ApiError,
    RequestError,
    JsonError,
    Timeout,
    NoContent,
    ParseError,
    Failed,
}

impl ExtractionStatus {
    pub const ALL: [ExtractionStatus; 8] = [
        Self::Success,
        Self::ApiError,
        Self::RequestError,
        Self::JsonError,
        Self::Timeout,
        Self::NoContent,
        Self::ParseError,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ApiError => "api_error",
            Self::RequestError => "request_error",
            Self::JsonError => "json_error",
            Self::Timeout => "timeout",
            Self::NoContent => "no_content",
            Self::ParseError => "parse_error",
            Self::Failed => "failed",
        }
    }

    /// 从磁盘上的字符串解析；未知值返回 None
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s.trim())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 补全通道：严格 API / AI 辅助（对话自动化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentTrack {
    Api,
    Free,
}

/// 补全后的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: Record,
    #[serde(default = "not_available")]
    pub email: String,
    #[serde(default = "not_available")]
    pub background: String,
    /// None 表示尚未经过补全（基础数据集）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_status: Option<ExtractionStatus>,
    #[serde(default, rename = "error_details", skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, rename = "raw_api_response", skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<EnrichmentTrack>,
}

impl EnrichedRecord {
    /// 尚未补全的记录：email / background 为 "N/A"
    pub fn pending(record: Record) -> Self {
        Self {
            record,
            email: not_available(),
            background: not_available(),
            extraction_status: None,
            error_detail: None,
            raw_response: None,
            source: None,
            extraction_method: None,
        }
    }

    /// 由一次补全结果构建；email / background 经过哨兵归一
    pub fn from_outcome(record: Record, outcome: Enrichment, track: EnrichmentTrack) -> Self {
        Self {
            record,
            email: normalize_sentinel(&outcome.email),
            background: normalize_sentinel(&outcome.background),
            extraction_status: Some(outcome.status),
            error_detail: outcome.error_detail,
            raw_response: outcome.raw_response,
            source: outcome.source,
            extraction_method: Some(track),
        }
    }

    /// 可参与外联：email 不是哨兵
    pub fn has_email(&self) -> bool {
        !is_sentinel(&self.email)
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }
}

/// 缺少背景介绍时，根据名称 / 地址 / 网站 / 评分确定性地合成一段
pub fn synthesize_background(record: &Record) -> String {
    let name = if is_sentinel(&record.title) {
        "Business"
    } else {
        record.title.trim()
    };
    let mut text = format!("{} is a professional business", name);
    if !is_sentinel(&record.address) {
        text.push_str(&format!(" located at {}", record.address.trim()));
    }
    if !is_sentinel(&record.website) {
        text.push_str(&format!(" with website {}", record.website.trim()));
    }
    if !is_sentinel(&record.rating_display) {
        text.push_str(&format!(". They have a rating of {}", record.rating_display.trim()));
    }
    text.push_str(
        ". They provide high-quality services in their industry and have established a strong reputation in their local market.",
    );
    text
}

/// 单次补全尝试的结果（两条通道共用）
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub email: String,
    pub background: String,
    pub status: ExtractionStatus,
    pub error_detail: Option<String>,
    pub raw_response: Option<String>,
    pub source: Option<String>,
}

impl Enrichment {
    /// 以某状态失败：email / background 均为 "N/A"
    pub fn failed(status: ExtractionStatus, error: impl Into<Option<String>>) -> Self {
        Self {
            email: not_available(),
            background: not_available(),
            status,
            error_detail: error.into(),
            raw_response: None,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// 数据集：有序记录 + 查询元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub query: String,
    pub captured_at: DateTime<Utc>,
    pub total_count: usize,
    pub records: Vec<EnrichedRecord>,
}

impl Dataset {
    pub fn new(query: impl Into<String>, records: Vec<Record>) -> Self {
        let records: Vec<EnrichedRecord> = records.into_iter().map(EnrichedRecord::pending).collect();
        Self {
            query: query.into(),
            captured_at: Utc::now(),
            total_count: records.len(),
            records,
        }
    }

    /// 外联工作集：email ≠ "N/A" 的记录（保持数据集顺序）
    pub fn eligible(&self) -> Vec<&EnrichedRecord> {
        self.records.iter().filter(|r| r.has_email()).collect()
    }

    /// 已补全记录中的 (成功, 失败) 计数
    pub fn extraction_summary(&self) -> (usize, usize) {
        let enriched: Vec<_> = self
            .records
            .iter()
            .filter_map(|r| r.extraction_status)
            .collect();
        let ok = enriched.iter().filter(|s| s.is_success()).count();
        (ok, enriched.len() - ok)
    }

    pub fn base_records(&self) -> Vec<Record> {
        self.records.iter().map(|r| r.record.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str) -> Record {
        Record {
            title: title.to_string(),
            ..Record::default()
        }
    }

    #[test]
    fn test_normalize_sentinel_phrases() {
        assert_eq!(normalize_sentinel("n/a"), "N/A");
        assert_eq!(normalize_sentinel("  Not Available "), "N/A");
        assert_eq!(normalize_sentinel("NOT FOUND"), "N/A");
        assert_eq!(normalize_sentinel(""), "N/A");
        assert_eq!(normalize_sentinel("info@acme.com"), "info@acme.com");
    }

    #[test]
    fn test_normalize_sentinel_idempotent() {
        for v in ["n/a", "x@y.io", "Not found", "   ", "Bakery since 1990"] {
            let once = normalize_sentinel(v);
            assert_eq!(normalize_sentinel(&once), once);
        }
    }

    #[test]
    fn test_status_round_trip_strings() {
        for st in ExtractionStatus::ALL {
            assert_eq!(ExtractionStatus::parse(st.as_str()), Some(st));
            let json = serde_json::to_string(&st).unwrap();
            assert_eq!(json, format!("\"{}\"", st.as_str()));
        }
        assert_eq!(ExtractionStatus::parse("phase1_complete"), None);
    }

    #[test]
    fn test_eligible_filters_sentinel_email() {
        let mut ds = Dataset::new("cafes", vec![record("A"), record("B"), record("C")]);
        ds.records[0].email = "a@a.com".into();
        ds.records[2].email = "not found".into();
        let eligible: Vec<_> = ds.eligible().iter().map(|r| r.title().to_string()).collect();
        assert_eq!(eligible, vec!["A".to_string()]);
    }

    #[test]
    fn test_from_outcome_normalizes() {
        let outcome = Enrichment {
            email: "Not Available".into(),
            background: "Family bakery".into(),
            status: ExtractionStatus::Success,
            error_detail: None,
            raw_response: None,
            source: None,
        };
        let r = EnrichedRecord::from_outcome(record("A"), outcome, EnrichmentTrack::Api);
        assert_eq!(r.email, "N/A");
        assert_eq!(r.background, "Family bakery");
        assert!(!r.has_email());
    }

    #[test]
    fn test_synthesize_background_skips_sentinels() {
        let r = Record {
            title: "Blue Door Cafe".into(),
            rating_display: "4.6 (212)".into(),
            address: "12 Elm St".into(),
            website: "N/A".into(),
            phone: "N/A".into(),
        };
        let text = synthesize_background(&r);
        assert!(text.starts_with("Blue Door Cafe is a professional business located at 12 Elm St."));
        assert!(text.contains("rating of 4.6 (212)"));
        assert!(!text.contains("website"));
        assert_eq!(text, synthesize_background(&r));
    }

    #[test]
    fn test_record_serde_uses_document_field_names() {
        let value = serde_json::to_value(EnrichedRecord::pending(record("A"))).unwrap();
        assert_eq!(value["title"], "A");
        assert_eq!(value["rating_and_reviews"], "N/A");
        assert!(value.get("extraction_status").is_none());
    }
}
