/// 批量摘要
///
/// 固定数量的并发工作者（默认 4 个）为所有尚无摘要的邮件生成摘要。
/// 每个任务只写自己那封邮件的一次性摘要槽，等待全部任务结束是唯一的同步点。
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::ai::gemini::Summarizer;
use crate::mail::gmail::types::EmailStore;

/// 默认并发工作者数量
pub const DEFAULT_WORKERS: usize = 4;

/// 一次批量摘要的结果统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SummaryReport {
    /// 本次新生成的摘要数
    pub summarized: usize,
    /// 已有摘要而跳过的邮件数
    pub skipped: usize,
    /// 失败数（摘要保持为空，可稍后重试）
    pub failed: usize,
}

enum Outcome {
    Summarized,
    Skipped,
    Failed,
}

/// 为 `store` 中所有尚无摘要的邮件生成摘要
///
/// `progress(finished, total)` 在每个任务结束后调用，`total` 只计需要生成的邮件。
pub async fn summarize_all<S, F>(
    store: &EmailStore,
    summarizer: Arc<S>,
    workers: usize,
    progress: F,
) -> SummaryReport
where
    S: Summarizer,
    F: Fn(usize, usize),
{
    let pending: Vec<_> = store
        .iter()
        .filter(|record| record.summary().is_none())
        .cloned()
        .collect();

    let mut report = SummaryReport {
        skipped: store.len() - pending.len(),
        ..SummaryReport::default()
    };
    let total = pending.len();
    if total == 0 {
        return report;
    }

    tracing::info!("🤖 开始批量摘要：{} 封（并发 {}）", total, workers.max(1));

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for record in pending {
        let semaphore = Arc::clone(&semaphore);
        let summarizer = Arc::clone(&summarizer);

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return Outcome::Failed;
            };

            // 单封摘要可能在排队期间先完成
            if record.summary().is_some() {
                return Outcome::Skipped;
            }

            match summarizer.summarize(&record.body).await {
                Ok(summary) => {
                    if record.set_summary(summary) {
                        Outcome::Summarized
                    } else {
                        Outcome::Skipped
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ 邮件 {} 摘要失败: {}", record.id, e);
                    Outcome::Failed
                }
            }
        });
    }

    let mut finished = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Outcome::Summarized) => report.summarized += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Ok(Outcome::Failed) => report.failed += 1,
            Err(e) => {
                tracing::error!("❌ 摘要任务异常退出: {}", e);
                report.failed += 1;
            }
        }
        finished += 1;
        progress(finished, total);
    }

    tracing::info!(
        "✅ 批量摘要完成：新增 {}，跳过 {}，失败 {}",
        report.summarized,
        report.skipped,
        report.failed
    );
    report
}
