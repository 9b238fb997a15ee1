/// 遥测数据定时落盘

use chrono::NaiveDate;
use common::protocol::TelemetryRecord;
use common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TelemetryBuffer, TelemetryStore};
use crate::metrics::Metrics;

/// 单次落盘结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub groups_written: usize,
    pub records_written: usize,
    /// 失败后放回缓冲区的分组
    pub groups_failed: usize,
    /// 重试也无法写入而丢弃的分组
    pub groups_dropped: usize,
}

#[derive(Clone)]
pub struct TelemetryFlusher {
    buffer: TelemetryBuffer,
    store: Arc<dyn TelemetryStore>,
    metrics: Arc<Metrics>,
}

impl TelemetryFlusher {
    pub fn new(buffer: TelemetryBuffer, store: Arc<dyn TelemetryStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            buffer,
            store,
            metrics,
        }
    }

    /// 将缓冲区中的全部分组追加写入存储
    ///
    /// 某个分组失败不影响其他分组，失败的记录放回缓冲区等待下次重试。
    /// 重试无法恢复的分组（如非法的 Bot 名称）直接丢弃。
    pub async fn flush(&self) -> FlushReport {
        let groups = self.buffer.drain().await;
        let mut report = FlushReport::default();
        if groups.is_empty() {
            return report;
        }

        info!("💾 正在保存 {} 组遥测数据...", groups.len());

        for ((bot_name, date), records) in groups {
            match self.persist(&bot_name, date, &records).await {
                Ok(total) => {
                    info!(
                        "✅ 已保存 {} {} 的遥测数据 ({} 条新记录，共 {} 条)",
                        bot_name,
                        date,
                        records.len(),
                        total
                    );
                    report.groups_written += 1;
                    report.records_written += records.len();
                    self.metrics.telemetry_flushed.inc_by(records.len() as u64);
                }
                Err(e) if e.is_permanent() => {
                    error!(
                        "❌ {} {} 的遥测数据无法写入，已丢弃 {} 条记录: {}",
                        bot_name,
                        date,
                        records.len(),
                        e
                    );
                    report.groups_dropped += 1;
                    self.metrics.flush_failures.inc();
                    self.metrics.telemetry_dropped.inc_by(records.len() as u64);
                }
                Err(e) => {
                    error!(
                        "❌ 保存 {} {} 的遥测数据失败，{} 条记录将在下次重试: {}",
                        bot_name,
                        date,
                        records.len(),
                        e
                    );
                    report.groups_failed += 1;
                    self.metrics.flush_failures.inc();
                    self.buffer.restore((bot_name, date), records).await;
                }
            }
        }

        report
    }

    /// 读取已有记录、追加新记录后整体写回，返回写入后的总条数
    ///
    /// 已有文件无法解析时先移到一旁，再从空列表开始写
    async fn persist(&self, bot_name: &str, date: NaiveDate, records: &[TelemetryRecord]) -> Result<usize> {
        let mut all = match self.store.load(bot_name, date).await {
            Ok(existing) => existing,
            Err(Error::CorruptData(reason)) => {
                let moved = self.store.quarantine(bot_name, date).await?;
                warn!(
                    "⚠️ {} {} 的已有数据无法解析，已移至 {}: {}",
                    bot_name, date, moved, reason
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        for record in records {
            all.push(serde_json::to_value(record)?);
        }
        self.store.save(bot_name, date, &all).await?;
        Ok(all.len())
    }

    /// 启动定时落盘任务，直到 shutdown 被取消
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.flush().await;
                        debug!("定时落盘完成: {:?}", report);
                    }
                    _ = shutdown.cancelled() => {
                        debug!("定时落盘任务结束");
                        break;
                    }
                }
            }
        })
    }
}
