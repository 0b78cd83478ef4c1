//! 补全层：严格 API 通道与 AI 辅助通道
//!
//! 两条通道都实现 Enricher；批处理逻辑（记录间隔、协作取消、进度回调、逐条隔离）共用 run_batch。

pub mod assisted;
pub mod decode;
pub mod strict;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dataset::{Dataset, EnrichedRecord, Enrichment, EnrichmentTrack, ExtractionStatus, Record};

pub use assisted::AssistedEnricher;
pub use strict::StrictEnricher;

/// 单条记录的补全器
#[async_trait]
pub trait Enricher: Send + Sync {
    fn track(&self) -> EnrichmentTrack;

    /// 批次开始前的一次性准备（如导航到对话页面）；失败时整批记录标记为 failed
    async fn prepare(&self) -> Result<(), String> {
        Ok(())
    }

    /// 对单条记录做一次补全；不返回错误，所有失败都折叠进状态标签
    async fn enrich(&self, record: &Record) -> Enrichment;

    /// 相邻两条记录之间的间隔
    fn record_delay(&self) -> Duration;
}

/// 批处理结果
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub records: Vec<EnrichedRecord>,
    pub successful: usize,
    pub failed: usize,
    /// 取消时尚未处理的记录数（这些记录保持未补全状态）
    pub skipped: usize,
}

/// 按顺序补全一批记录
///
/// - 记录之间等待 `record_delay`，最后一条之后不等
/// - 每条记录之前检查取消令牌；取消后剩余记录原样保留为未补全
/// - `progress(done, total)` 在每条记录完成后调用
pub async fn run_batch(
    enricher: &dyn Enricher,
    records: Vec<Record>,
    cancel: &CancellationToken,
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> BatchOutcome {
    let total = records.len();
    let track = enricher.track();
    let mut out = Vec::with_capacity(total);
    let mut successful = 0;
    let mut failed = 0;

    tracing::info!(track = ?track, total, "starting enrichment batch");

    let prepared = if total > 0 {
        enricher.prepare().await
    } else {
        Ok(())
    };

    let mut pending = records.into_iter().enumerate().peekable();
    while let Some((i, record)) = pending.next() {
        if cancel.is_cancelled() {
            tracing::info!(done = i, total, "enrichment cancelled");
            out.push(EnrichedRecord::pending(record));
            out.extend(pending.map(|(_, r)| EnrichedRecord::pending(r)));
            break;
        }

        let outcome = match &prepared {
            Ok(()) => enricher.enrich(&record).await,
            Err(e) => Enrichment::failed(ExtractionStatus::Failed, Some(e.clone())),
        };
        if outcome.status.is_success() {
            successful += 1;
        } else {
            failed += 1;
        }
        tracing::info!(
            index = i + 1,
            total,
            title = %record.title,
            status = %outcome.status,
            "record enriched"
        );
        out.push(EnrichedRecord::from_outcome(record, outcome, track));
        progress(i + 1, total);

        let is_last = pending.peek().is_none();
        if !is_last && prepared.is_ok() {
            let delay = enricher.record_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let skipped = total - successful - failed;
    tracing::info!(successful, failed, skipped, "enrichment batch finished");
    BatchOutcome {
        records: out,
        successful,
        failed,
        skipped,
    }
}

/// 对整个数据集的基础记录做一次补全，结果原地写回 `dataset.records`
///
/// 只覆盖本轮实际处理过的记录；取消后未处理的记录保留原有补全数据。
/// 返回的 `records` 是写回后的完整列表。
pub async fn enrich_dataset(
    dataset: &mut Dataset,
    enricher: &dyn Enricher,
    cancel: &CancellationToken,
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> BatchOutcome {
    let mut outcome = run_batch(enricher, dataset.base_records(), cancel, progress).await;
    let processed = outcome.successful + outcome.failed;
    for (slot, fresh) in dataset
        .records
        .iter_mut()
        .zip(outcome.records.drain(..))
        .take(processed)
    {
        *slot = fresh;
    }
    outcome.records = dataset.records.clone();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEnricher {
        calls: AtomicUsize,
        fail_prepare: bool,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl Enricher for CountingEnricher {
        fn track(&self) -> EnrichmentTrack {
            EnrichmentTrack::Api
        }

        async fn prepare(&self) -> Result<(), String> {
            if self.fail_prepare {
                Err("Navigation failed".into())
            } else {
                Ok(())
            }
        }

        async fn enrich(&self, record: &Record) -> Enrichment {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, token)) = &self.cancel_after {
                if n == *after {
                    token.cancel();
                }
            }
            Enrichment {
                email: format!("{}@example.com", record.title.to_lowercase()),
                background: "N/A".into(),
                status: ExtractionStatus::Success,
                error_detail: None,
                raw_response: None,
                source: None,
            }
        }

        fn record_delay(&self) -> Duration {
            Duration::ZERO
        }
    }

    fn records(titles: &[&str]) -> Vec<Record> {
        titles
            .iter()
            .map(|t| Record {
                title: t.to_string(),
                ..Record::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_enriches_all_in_order() {
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail_prepare: false,
            cancel_after: None,
        };
        let mut seen = Vec::new();
        let out = run_batch(
            &enricher,
            records(&["A", "B", "C"]),
            &CancellationToken::new(),
            &mut |done, total| seen.push((done, total)),
        )
        .await;

        assert_eq!(out.successful, 3);
        assert_eq!(out.records[1].email, "b@example.com");
        assert_eq!(out.records[2].extraction_method, Some(EnrichmentTrack::Api));
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_cancel_keeps_remaining_records_pending() {
        let token = CancellationToken::new();
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail_prepare: false,
            cancel_after: Some((1, token.clone())),
        };
        let out = run_batch(&enricher, records(&["A", "B", "C"]), &token, &mut |_, _| {}).await;

        assert_eq!(out.records.len(), 3);
        assert_eq!(out.successful, 1);
        assert_eq!(out.skipped, 2);
        assert!(out.records[1].extraction_status.is_none());
        assert_eq!(out.records[2].title(), "C");
    }

    #[tokio::test]
    async fn test_enrich_dataset_replaces_records() {
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail_prepare: false,
            cancel_after: None,
        };
        let mut dataset = Dataset::new("cafes", records(&["A", "B"]));
        let out = enrich_dataset(&mut dataset, &enricher, &CancellationToken::new(), &mut |_, _| {}).await;

        assert_eq!(out.successful, 2);
        assert_eq!(dataset.records[0].email, "a@example.com");
        assert_eq!(dataset.extraction_summary(), (2, 0));
        assert_eq!(dataset.total_count, 2);
    }

    #[tokio::test]
    async fn test_cancelled_repass_keeps_earlier_enrichment() {
        let first = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail_prepare: false,
            cancel_after: None,
        };
        let mut dataset = Dataset::new("cafes", records(&["A", "B", "C"]));
        enrich_dataset(&mut dataset, &first, &CancellationToken::new(), &mut |_, _| {}).await;
        dataset.records[0].email = "old@example.com".into();

        let token = CancellationToken::new();
        let second = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail_prepare: false,
            cancel_after: Some((1, token.clone())),
        };
        let out = enrich_dataset(&mut dataset, &second, &token, &mut |_, _| {}).await;

        assert_eq!(out.successful, 1);
        assert_eq!(out.skipped, 2);
        // 第一条被重新补全，其余保持上一轮的结果
        assert_eq!(dataset.records[0].email, "a@example.com");
        assert_eq!(dataset.records[1].email, "b@example.com");
        assert_eq!(
            dataset.records[1].extraction_status,
            Some(ExtractionStatus::Success)
        );
        assert_eq!(dataset.records[2].email, "c@example.com");
        assert_eq!(out.records[1].email, "b@example.com");
        assert_eq!(dataset.extraction_summary(), (3, 0));
    }

    #[tokio::test]
    async fn test_prepare_failure_marks_every_record_failed() {
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail_prepare: true,
            cancel_after: None,
        };
        let out = run_batch(
            &enricher,
            records(&["A", "B"]),
            &CancellationToken::new(),
            &mut |_, _| {},
        )
        .await;

        assert_eq!(out.failed, 2);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            out.records[0].extraction_status,
            Some(ExtractionStatus::Failed)
        );
        assert_eq!(out.records[0].error_detail.as_deref(), Some("Navigation failed"));
    }
}
