//! 抓取作业：导航 → 翻页 → 抽取 → 保存 → （可选）补全
//!
//! 整个作业只驱动一个自动化会话；AI 辅助补全复用同一会话。
//! 只有会话启动失败、导航失败与存储失败会向调用方传播，并同时写入状态快照。

pub mod extractor;
pub mod lister;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::browser::{AutomationSession, SessionLauncher};
use crate::config::AppConfig;
use crate::core::{ScrapeError, ScrapeStatus, StatusSink};
use crate::dataset::{Dataset, DatasetFormat, DatasetStore};
use crate::enrich::{enrich_dataset, AssistedEnricher, BatchOutcome, Enricher, StrictEnricher};
use crate::llm::{HttpChatClient, LlmClient};

pub use extractor::{compose_rating, ExtractOutcome, FieldValue, RecordExtractor};
pub use lister::{ListingOutcome, ResultLister};

/// 补全方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentMode {
    #[default]
    Skip,
    /// 严格 API 通道
    Api,
    /// AI 辅助通道（对话自动化）
    Free,
}

#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub query: String,
    pub max_results: usize,
    pub format: DatasetFormat,
    pub enrichment: EnrichmentMode,
}

/// 作业结果摘要
#[derive(Debug, Clone)]
pub struct ScrapeReport {
    pub job_id: String,
    pub listing: ListingOutcome,
    pub extracted: usize,
    pub output: Option<PathBuf>,
    /// (成功, 失败)；未补全时为 None
    pub enrichment: Option<(usize, usize)>,
}

/// 当前快照 + 发布
struct Reporter<'a> {
    sink: &'a dyn StatusSink<ScrapeStatus>,
    current: ScrapeStatus,
}

impl<'a> Reporter<'a> {
    fn update(&mut self, f: impl FnOnce(&mut ScrapeStatus)) {
        f(&mut self.current);
        self.sink.publish(self.current.clone());
    }

    fn message(&mut self, progress: u8, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.progress = progress;
            s.message = message;
        });
    }

    fn finish(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.running = false;
            s.message = message;
        });
    }

    fn fail(&mut self, error: &ScrapeError) {
        tracing::error!(error = %error, "scraping failed");
        let reason = error.to_string();
        self.update(|s| {
            s.running = false;
            s.message = format!("Error during scraping: {}", reason);
            s.errors.push(reason);
        });
    }
}

/// 在 [from, to] 区间内按完成比例插值的进度
fn scaled(from: u8, to: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return to;
    }
    let span = (to - from) as usize;
    from + (span * done.min(total) / total) as u8
}

pub struct ScrapeJob {
    config: AppConfig,
    launcher: Arc<dyn SessionLauncher>,
    store: DatasetStore,
    strict_client: Option<Arc<dyn LlmClient>>,
}

impl ScrapeJob {
    pub fn new(config: AppConfig, launcher: Arc<dyn SessionLauncher>) -> Self {
        let store = DatasetStore::new(&config.app.data_dir);
        Self {
            config,
            launcher,
            store,
            strict_client: None,
        }
    }

    pub fn with_store(mut self, store: DatasetStore) -> Self {
        self.store = store;
        self
    }

    /// 指定严格通道使用的客户端（否则按配置与环境变量中的 API Key 构建）
    pub fn with_strict_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.strict_client = Some(client);
        self
    }

    fn strict_client(&self) -> Option<Arc<dyn LlmClient>> {
        if let Some(client) = &self.strict_client {
            return Some(Arc::clone(client));
        }
        let strict = &self.config.enrichment.strict;
        strict.api_key().map(|key| {
            Arc::new(HttpChatClient::new(
                &strict.endpoint,
                &strict.model,
                &key,
                strict.timeout(),
            )) as Arc<dyn LlmClient>
        })
    }

    pub async fn run(
        &self,
        request: ScrapeRequest,
        cancel: &CancellationToken,
        sink: &dyn StatusSink<ScrapeStatus>,
    ) -> Result<ScrapeReport, ScrapeError> {
        let job_id = Uuid::new_v4().to_string();
        let mut reporter = Reporter {
            sink,
            current: ScrapeStatus::starting(job_id.clone()),
        };
        sink.publish(reporter.current.clone());

        let query = request.query.trim().to_string();
        if query.is_empty() {
            let err = ScrapeError::EmptyQuery;
            reporter.fail(&err);
            return Err(err);
        }
        tracing::info!(job_id = %job_id, query = %query, "scrape job started");

        reporter.message(0, "Creating browser driver...");
        let session = match self.launcher.launch().await {
            Ok(s) => s,
            Err(e) => {
                let err = ScrapeError::SessionStart(e);
                reporter.fail(&err);
                return Err(err);
            }
        };

        match self
            .drive(session, &job_id, &query, &request, cancel, &mut reporter)
            .await
        {
            Ok(report) => Ok(report),
            Err(err) => {
                reporter.fail(&err);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session: Arc<dyn AutomationSession>,
        job_id: &str,
        query: &str,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
        reporter: &mut Reporter<'_>,
    ) -> Result<ScrapeReport, ScrapeError> {
        let scraper = &self.config.scraper;

        reporter.message(2, "Navigating to Google Maps...");
        session
            .navigate(&scraper.search_url(query))
            .await
            .map_err(ScrapeError::Navigation)?;

        reporter.message(5, "Loading search results...");
        let listing = ResultLister::new(session.as_ref(), scraper)
            .run(query, cancel)
            .await;

        reporter.update(|s| {
            s.progress = 10;
            s.message = "Counting available results...".to_string();
            s.total_found = listing.item_count;
        });
        let mut report = ScrapeReport {
            job_id: job_id.to_string(),
            listing,
            extracted: 0,
            output: None,
            enrichment: None,
        };
        if listing.item_count == 0 {
            reporter.finish("No results found");
            return Ok(report);
        }

        let target = request.max_results.min(listing.item_count);
        reporter.message(10, format!("Scraping {} results...", target));
        let extracted = RecordExtractor::new(session.as_ref(), scraper)
            .run(target, cancel, &mut |done, total| {
                reporter.update(|s| {
                    s.scraped_count = done;
                    s.progress = scaled(10, 70, done, total);
                })
            })
            .await;
        report.extracted = extracted.records.len();
        if extracted.records.is_empty() {
            reporter.finish("No data was scraped");
            return Ok(report);
        }

        reporter.message(72, "Saving scraped data...");
        let mut dataset = Dataset::new(query, extracted.records);
        let path = self.store.save(&dataset, request.format)?;
        report.output = Some(path.clone());
        reporter.update(|s| s.output = Some(path.clone()));

        if request.enrichment != EnrichmentMode::Skip && !cancel.is_cancelled() {
            reporter.message(75, "Starting email extraction...");
            if let Some(track) = self.select_track(request.enrichment) {
                let enricher = self.enricher(track, &session).await;
                let outcome = enrich_dataset(
                    &mut dataset,
                    enricher.as_ref(),
                    cancel,
                    &mut |done, total| {
                        reporter.update(|s| {
                            s.enriched_count = done;
                            s.progress = scaled(75, 95, done, total);
                        })
                    },
                )
                .await;
                self.store.save_with_added_fields(&path, &dataset)?;
                tracing::info!(
                    successful = outcome.successful,
                    failed = outcome.failed,
                    "email extraction finished"
                );
                reporter.update(|s| {
                    s.enriched_count = outcome.successful + outcome.failed;
                    s.message = format!(
                        "Email extraction completed: {} processed",
                        outcome.successful + outcome.failed
                    );
                });
                report.enrichment = Some((outcome.successful, outcome.failed));
            }
        }

        let saved = report.extracted;
        if cancel.is_cancelled() {
            reporter.finish(format!(
                "Scraping stopped by user. Saved {} results to {}",
                saved,
                path.display()
            ));
            tracing::info!(job_id, extracted = saved, "scrape job stopped");
            return Ok(report);
        }
        reporter.update(|s| {
            s.running = false;
            s.progress = 100;
            s.message = format!(
                "Scraping completed! Saved {} results to {}",
                saved,
                path.display()
            );
        });
        tracing::info!(job_id, extracted = saved, "scrape job finished");
        Ok(report)
    }

    /// 严格通道缺少 API Key 时退回 AI 辅助通道
    fn select_track(&self, mode: EnrichmentMode) -> Option<Track> {
        match mode {
            EnrichmentMode::Skip => None,
            EnrichmentMode::Free => Some(Track::Assisted),
            EnrichmentMode::Api => match self.strict_client() {
                Some(client) => Some(Track::Strict(client)),
                None => {
                    tracing::warn!("no API key provided, switching to free method");
                    Some(Track::Assisted)
                }
            },
        }
    }

    async fn enricher(&self, track: Track, session: &Arc<dyn AutomationSession>) -> Box<dyn Enricher> {
        match track {
            Track::Strict(client) => {
                Box::new(StrictEnricher::connect(client, &self.config.enrichment.strict).await)
            }
            Track::Assisted => Box::new(AssistedEnricher::new(
                Arc::clone(session),
                self.config.enrichment.assisted.clone(),
            )),
        }
    }

    /// 对已保存的数据集单独补全，并原地写回新增字段
    ///
    /// 只有 AI 辅助通道需要启动会话；`Skip` 直接返回 None。
    pub async fn enrich_saved(
        &self,
        path: &Path,
        mode: EnrichmentMode,
        cancel: &CancellationToken,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<Option<BatchOutcome>, ScrapeError> {
        let Some(track) = self.select_track(mode) else {
            return Ok(None);
        };
        let mut dataset = self.store.load(path)?;
        tracing::info!(path = %path.display(), records = dataset.records.len(), "enriching saved dataset");

        let enricher: Box<dyn Enricher> = match track {
            Track::Strict(client) => {
                Box::new(StrictEnricher::connect(client, &self.config.enrichment.strict).await)
            }
            Track::Assisted => {
                let session = self
                    .launcher
                    .launch()
                    .await
                    .map_err(ScrapeError::SessionStart)?;
                self.enricher(Track::Assisted, &session).await
            }
        };

        let outcome = enrich_dataset(&mut dataset, enricher.as_ref(), cancel, progress).await;
        self.store.save_with_added_fields(path, &dataset)?;
        Ok(Some(outcome))
    }
}

/// 选定的补全通道
enum Track {
    Strict(Arc<dyn LlmClient>),
    Assisted,
}
