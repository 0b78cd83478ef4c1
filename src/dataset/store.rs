//! 数据集存储：表格（CSV）与结构化文档（JSON）两种可互换形态
//!
//! 核心只依赖 load / save / save_with_added_fields；文件名带时间戳，
//! 文档形态为 `{search_query, scraped_at, total_results, places[], extraction_summary?}`。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{
    is_sentinel, synthesize_background, Dataset, EnrichedRecord, ExtractionStatus, Record,
    NOT_AVAILABLE,
};

/// 补全记录中只在有值时才序列化的键；合并时新记录不再携带的旧值要清掉
const OPTIONAL_FIELDS: [&str; 5] = [
    "extraction_status",
    "error_details",
    "raw_api_response",
    "source",
    "extraction_method",
];

/// 基础表头（未补全）
pub const BASIC_HEADERS: [&str; 6] = [
    "Title",
    "Rating & Reviews",
    "Address",
    "Website",
    "Phone",
    "Search Query",
];

/// 补全后表头
pub const ENHANCED_HEADERS: [&str; 9] = [
    "Title",
    "Rating & Reviews",
    "Address",
    "Website",
    "Phone",
    "Email",
    "Background",
    "Search Query",
    "Extraction Status",
];

/// 文件名前缀（list_datasets 依此过滤）
const FILE_PREFIX: &str = "scraped_data_";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported dataset format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Malformed dataset: {0}")]
    Shape(String),
}

/// 数据集形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Csv,
    Json,
}

impl DatasetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            _ => Err(StoreError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// 文档形态（JSON）
#[derive(Debug, Serialize, Deserialize)]
struct DatasetDocument {
    search_query: String,
    #[serde(default = "Utc::now")]
    scraped_at: DateTime<Utc>,
    #[serde(default)]
    total_results: usize,
    #[serde(default)]
    places: Vec<EnrichedRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extraction_summary: Option<Value>,
}

/// 数据集存储：根目录 + 时间戳格式
#[derive(Debug, Clone)]
pub struct DatasetStore {
    dir: PathBuf,
    timestamp_format: String,
}

impl DatasetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
        }
    }

    pub fn with_timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = format.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 解析相对文件名（相对于数据目录）；绝对路径原样返回
    pub fn resolve(&self, name: impl AsRef<Path>) -> PathBuf {
        let name = name.as_ref();
        if name.is_absolute() || name.exists() {
            name.to_path_buf()
        } else {
            self.dir.join(name)
        }
    }

    /// 以时间戳文件名保存新数据集，返回路径；同名文件已存在时追加 `_1`、`_2`…
    pub fn save(&self, dataset: &Dataset, format: DatasetFormat) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = format!(
            "{}{}",
            FILE_PREFIX,
            dataset.captured_at.format(&self.timestamp_format)
        );
        let mut path = self.dir.join(format!("{}.{}", stem, format.extension()));
        let mut suffix = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{}_{}.{}", stem, suffix, format.extension()));
            suffix += 1;
        }
        self.write(&path, dataset, format)?;
        tracing::info!(path = %path.display(), records = dataset.records.len(), "dataset saved");
        Ok(path)
    }

    /// 读取数据集（按扩展名判断形态）
    pub fn load(&self, path: &Path) -> Result<Dataset, StoreError> {
        match DatasetFormat::from_path(path)? {
            DatasetFormat::Json => load_json(path),
            DatasetFormat::Csv => load_csv(path),
        }
    }

    /// 补全后原地更新：文档形态合并新增字段并写入 extraction_summary，表格形态改写为补全表头
    pub fn save_with_added_fields(&self, path: &Path, dataset: &Dataset) -> Result<(), StoreError> {
        match DatasetFormat::from_path(path)? {
            DatasetFormat::Json => merge_json(path, dataset)?,
            DatasetFormat::Csv => write_csv(path, dataset)?,
        }
        tracing::info!(path = %path.display(), "dataset updated with enrichment fields");
        Ok(())
    }

    /// 列出数据目录下的已保存数据集（按文件名排序）
    pub fn list_datasets(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for ext in ["csv", "json"] {
            let pattern = self.dir.join(format!("{}*.{}", FILE_PREFIX, ext));
            let Some(pattern) = pattern.to_str() else {
                continue;
            };
            if let Ok(paths) = glob::glob(pattern) {
                files.extend(paths.filter_map(Result::ok));
            }
        }
        files.sort();
        files
    }

    /// 为缺少背景介绍的记录合成背景；有改动时先写时间戳备份再覆盖，返回改动条数
    pub fn backfill_backgrounds(&self, path: &Path) -> Result<usize, StoreError> {
        let mut dataset = self.load(path)?;
        let mut changed = 0;
        for r in dataset.records.iter_mut() {
            if is_sentinel(&r.background) {
                r.background = synthesize_background(&r.record);
                changed += 1;
            }
        }
        if changed == 0 {
            tracing::info!(path = %path.display(), "no background backfill needed");
            return Ok(0);
        }

        let stamp = Utc::now().format(&self.timestamp_format);
        let backup = PathBuf::from(format!("{}.backup_{}", path.display(), stamp));
        std::fs::copy(path, &backup)?;
        tracing::info!(backup = %backup.display(), "backup written");

        self.save_with_added_fields(path, &dataset)?;
        Ok(changed)
    }

    fn write(&self, path: &Path, dataset: &Dataset, format: DatasetFormat) -> Result<(), StoreError> {
        match format {
            DatasetFormat::Json => {
                let doc = DatasetDocument {
                    search_query: dataset.query.clone(),
                    scraped_at: dataset.captured_at,
                    total_results: dataset.records.len(),
                    places: dataset.records.clone(),
                    extraction_summary: summary_value(dataset),
                };
                std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
                Ok(())
            }
            DatasetFormat::Csv => write_csv(path, dataset),
        }
    }
}

fn summary_value(dataset: &Dataset) -> Option<Value> {
    let method = dataset.records.iter().find_map(|r| r.extraction_method)?;
    let (successful, failed) = dataset.extraction_summary();
    Some(serde_json::json!({
        "method": method,
        "successful": successful,
        "failed": failed,
    }))
}

fn load_json(path: &Path) -> Result<Dataset, StoreError> {
    let data = std::fs::read_to_string(path)?;
    let doc: DatasetDocument = serde_json::from_str(&data)?;
    Ok(Dataset {
        query: doc.search_query,
        captured_at: doc.scraped_at,
        total_count: doc.places.len(),
        records: doc.places,
    })
}

fn merge_json(path: &Path, dataset: &Dataset) -> Result<(), StoreError> {
    let data = std::fs::read_to_string(path)?;
    let mut doc: Value = serde_json::from_str(&data)?;
    let places = doc
        .get_mut("places")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| StoreError::Shape("missing 'places' list".to_string()))?;

    for (place, enriched) in places.iter_mut().zip(dataset.records.iter()) {
        let Some(obj) = place.as_object_mut() else {
            continue;
        };
        let added = serde_json::to_value(enriched)?;
        if let Value::Object(fields) = added {
            obj.retain(|k, _| !OPTIONAL_FIELDS.contains(&k.as_str()) || fields.contains_key(k));
            for (k, v) in fields {
                obj.insert(k, v);
            }
        }
    }

    if let (Some(summary), Some(obj)) = (summary_value(dataset), doc.as_object_mut()) {
        obj.insert("extraction_summary".to_string(), summary);
    }
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

fn write_csv(path: &Path, dataset: &Dataset) -> Result<(), StoreError> {
    let enhanced = dataset
        .records
        .iter()
        .any(|r| r.extraction_status.is_some() || !is_sentinel(&r.email) || !is_sentinel(&r.background));
    let mut writer = csv::Writer::from_path(path)?;
    if enhanced {
        writer.write_record(ENHANCED_HEADERS)?;
    } else {
        writer.write_record(BASIC_HEADERS)?;
    }
    for r in &dataset.records {
        let rec = &r.record;
        if enhanced {
            let status = r
                .extraction_status
                .map(|s| s.as_str().to_string())
                .unwrap_or_default();
            writer.write_record([
                rec.title.as_str(),
                rec.rating_display.as_str(),
                rec.address.as_str(),
                rec.website.as_str(),
                rec.phone.as_str(),
                r.email.as_str(),
                r.background.as_str(),
                dataset.query.as_str(),
                status.as_str(),
            ])?;
        } else {
            writer.write_record([
                rec.title.as_str(),
                rec.rating_display.as_str(),
                rec.address.as_str(),
                rec.website.as_str(),
                rec.phone.as_str(),
                dataset.query.as_str(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn load_csv(path: &Path) -> Result<Dataset, StoreError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h.trim() == name);
    let title = col("Title").ok_or_else(|| StoreError::Shape("missing 'Title' column".to_string()))?;
    let (rating, address, website, phone) = (
        col("Rating & Reviews"),
        col("Address"),
        col("Website"),
        col("Phone"),
    );
    let (email, background, query, status) = (
        col("Email"),
        col("Background"),
        col("Search Query"),
        col("Extraction Status"),
    );

    let mut records = Vec::new();
    let mut search_query = String::new();
    for row in reader.records() {
        let row = row?;
        let cell = |idx: Option<usize>| -> String {
            idx.and_then(|i| row.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(NOT_AVAILABLE)
                .to_string()
        };
        if search_query.is_empty() {
            if let Some(q) = query.and_then(|i| row.get(i)) {
                search_query = q.to_string();
            }
        }
        let mut enriched = EnrichedRecord::pending(Record {
            title: cell(Some(title)),
            rating_display: cell(rating),
            address: cell(address),
            website: cell(website),
            phone: cell(phone),
        });
        enriched.email = cell(email);
        enriched.background = cell(background);
        enriched.extraction_status = status
            .and_then(|i| row.get(i))
            .and_then(ExtractionStatus::parse);
        records.push(enriched);
    }

    Ok(Dataset {
        query: search_query,
        captured_at: Utc::now(),
        total_count: records.len(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{EnrichmentTrack, Enrichment};

    fn sample() -> Dataset {
        Dataset::new(
            "coffee in austin",
            vec![
                Record {
                    title: "Blue Door Cafe".into(),
                    rating_display: "4.6 (212)".into(),
                    address: "12 Elm St".into(),
                    website: "bluedoor.example".into(),
                    phone: "555-0101".into(),
                },
                Record {
                    title: "Roast, Inc.".into(),
                    ..Record::default()
                },
            ],
        )
    }

    fn enrich(ds: &mut Dataset) {
        let first = ds.records[0].record.clone();
        ds.records[0] = EnrichedRecord::from_outcome(
            first,
            Enrichment {
                email: "hello@bluedoor.example".into(),
                background: "Neighbourhood cafe".into(),
                status: ExtractionStatus::Success,
                error_detail: None,
                raw_response: None,
                source: None,
            },
            EnrichmentTrack::Api,
        );
        let second = ds.records[1].record.clone();
        ds.records[1] = EnrichedRecord::from_outcome(
            second,
            Enrichment::failed(ExtractionStatus::ApiError, Some("HTTP 500: boom".to_string())),
            EnrichmentTrack::Api,
        );
    }

    #[test]
    fn test_json_save_load_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let mut ds = sample();
        let path = store.save(&ds, DatasetFormat::Json).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("scraped_data_"));

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.query, "coffee in austin");
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[1].record.title, "Roast, Inc.");
        assert_eq!(loaded.records[0].extraction_status, None);

        enrich(&mut ds);
        store.save_with_added_fields(&path, &ds).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["places"][0]["email"], "hello@bluedoor.example");
        assert_eq!(raw["places"][1]["extraction_status"], "api_error");
        assert_eq!(raw["places"][1]["error_details"], "HTTP 500: boom");
        assert_eq!(raw["extraction_summary"]["method"], "api");
        assert_eq!(raw["extraction_summary"]["successful"], 1);
        assert_eq!(raw["extraction_summary"]["failed"], 1);

        let reloaded = store.load(&path).unwrap();
        assert_eq!(reloaded.eligible().len(), 1);
    }

    #[test]
    fn test_merge_drops_stale_failure_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let mut ds = sample();
        let path = store.save(&ds, DatasetFormat::Json).unwrap();
        enrich(&mut ds);
        ds.records[1].raw_response = Some("<html>boom</html>".into());
        store.save_with_added_fields(&path, &ds).unwrap();

        let second = ds.records[1].record.clone();
        ds.records[1] = EnrichedRecord::from_outcome(
            second,
            Enrichment {
                email: "info@roast.example".into(),
                background: "Roastery".into(),
                status: ExtractionStatus::Success,
                error_detail: None,
                raw_response: None,
                source: None,
            },
            EnrichmentTrack::Api,
        );
        store.save_with_added_fields(&path, &ds).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let place = raw["places"][1].as_object().unwrap();
        assert_eq!(place["extraction_status"], "success");
        assert_eq!(place["email"], "info@roast.example");
        assert!(!place.contains_key("error_details"));
        assert!(!place.contains_key("raw_api_response"));
        // 非补全字段保持不动
        assert_eq!(place["title"], "Roast, Inc.");
        assert_eq!(raw["extraction_summary"]["successful"], 2);
    }

    #[test]
    fn test_same_second_saves_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let ds = sample();
        let first = store.save(&ds, DatasetFormat::Json).unwrap();
        let second = store.save(&ds, DatasetFormat::Json).unwrap();
        let third = store.save(&ds, DatasetFormat::Json).unwrap();

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.json"));
        assert!(third.to_string_lossy().ends_with("_2.json"));
        assert_eq!(store.list_datasets().len(), 3);
        assert_eq!(store.load(&first).unwrap().records.len(), 2);
    }

    #[test]
    fn test_csv_basic_then_enhanced() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let mut ds = sample();
        let path = store.save(&ds, DatasetFormat::Csv).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Title,Rating & Reviews,Address,Website,Phone,Search Query"));
        assert!(text.contains("\"Roast, Inc.\""));

        enrich(&mut ds);
        store.save_with_added_fields(&path, &ds).unwrap();
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.query, "coffee in austin");
        assert_eq!(loaded.records[0].email, "hello@bluedoor.example");
        assert_eq!(loaded.records[0].extraction_status, Some(ExtractionStatus::Success));
        assert_eq!(loaded.records[1].extraction_status, Some(ExtractionStatus::ApiError));
        assert_eq!(loaded.records[1].record.title, "Roast, Inc.");
    }

    #[test]
    fn test_list_datasets_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        store.save(&sample(), DatasetFormat::Json).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(store.list_datasets().len(), 1);
        assert!(matches!(
            store.load(&dir.path().join("notes.txt")),
            Err(StoreError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_backfill_writes_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let path = store.save(&sample(), DatasetFormat::Json).unwrap();

        let changed = store.backfill_backgrounds(&path).unwrap();
        assert_eq!(changed, 2);
        let ds = store.load(&path).unwrap();
        assert!(ds.records[0].background.starts_with("Blue Door Cafe is a professional business"));

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".backup_"))
            .count();
        assert_eq!(backups, 1);
        assert_eq!(store.backfill_backgrounds(&path).unwrap(), 0);
    }
}
