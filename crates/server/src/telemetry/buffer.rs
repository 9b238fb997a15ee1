/// 遥测数据内存缓冲区

use chrono::NaiveDate;
use common::protocol::TelemetryRecord;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 分组键：(Bot 名称, 接收日期)
pub type GroupKey = (String, NaiveDate);

/// 按 (Bot, 日期) 分组累积记录，组内保持到达顺序
#[derive(Clone, Default)]
pub struct TelemetryBuffer {
    groups: Arc<Mutex<BTreeMap<GroupKey, Vec<TelemetryRecord>>>>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记录，不涉及任何 IO
    pub async fn append(&self, record: TelemetryRecord) {
        let key = (record.bot_name.clone(), record.timestamp.date_naive());
        let mut groups = self.groups.lock().await;
        groups.entry(key).or_default().push(record);
    }

    /// 取出全部分组，缓冲区清空
    pub async fn drain(&self) -> Vec<(GroupKey, Vec<TelemetryRecord>)> {
        let mut groups = self.groups.lock().await;
        std::mem::take(&mut *groups).into_iter().collect()
    }

    /// 放回写入失败的分组，排在期间新到达的记录之前
    pub async fn restore(&self, key: GroupKey, mut records: Vec<TelemetryRecord>) {
        let mut groups = self.groups.lock().await;
        let slot = groups.entry(key).or_default();
        records.append(slot);
        *slot = records;
    }

    /// 缓冲中的记录总数
    pub async fn len(&self) -> usize {
        let groups = self.groups.lock().await;
        groups.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 缓冲中的分组数
    pub async fn group_count(&self) -> usize {
        self.groups.lock().await.len()
    }
}
