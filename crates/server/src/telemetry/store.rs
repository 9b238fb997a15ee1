/// 遥测数据持久化
///
/// 每个 Bot 每天一个文件：`{botName}_{YYYY-MM-DD}.json`，内容为 JSON 数组。
/// 数组元素按原样保留，不要求符合当前的记录格式。

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::utils::{data_file_name, is_valid_bot_name, parse_data_file_name, DATE_FORMAT};
use common::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 数据文件信息
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DataFileInfo {
    pub date: String,
    pub file: String,
    pub size: u64,
    pub modified: String,
}

/// 遥测数据存储接口
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// 读取某个 Bot 某天的全部记录，不存在时返回空列表
    ///
    /// 内容不是 JSON 数组时返回 `Error::CorruptData`
    async fn load(&self, bot_name: &str, date: NaiveDate) -> Result<Vec<Value>>;

    /// 覆盖写入某个 Bot 某天的全部记录
    async fn save(&self, bot_name: &str, date: NaiveDate, records: &[Value]) -> Result<()>;

    /// 将无法解析的数据文件移到一旁，返回新的文件名
    async fn quarantine(&self, bot_name: &str, date: NaiveDate) -> Result<String>;

    /// 列出某个 Bot 的数据文件（按日期倒序）
    async fn list_files(&self, bot_name: &str) -> Result<Vec<DataFileInfo>>;

    /// 列出所有有数据的 Bot 名称（升序）
    async fn list_bots(&self) -> Result<Vec<String>>;
}

/// 基于本地目录的存储
pub struct FileTelemetryStore {
    dir: PathBuf,
}

impl FileTelemetryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, bot_name: &str, date: NaiveDate) -> Result<PathBuf> {
        if !is_valid_bot_name(bot_name) {
            return Err(Error::InvalidArgument(format!("非法的 Bot 名称: {}", bot_name)));
        }
        Ok(self.dir.join(data_file_name(bot_name, date)))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if tokio::fs::metadata(&self.dir).await.is_err() {
            tokio::fs::create_dir_all(&self.dir).await?;
            info!("📁 遥测数据目录已创建: {}", self.dir.display());
        }
        Ok(())
    }

    /// 读取目录下所有合法的数据文件名
    async fn data_files(&self) -> Result<Vec<(String, NaiveDate, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some((bot_name, date)) = parse_data_file_name(&name) {
                files.push((bot_name, date, entry.path()));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl TelemetryStore for FileTelemetryStore {
    async fn load(&self, bot_name: &str, date: NaiveDate) -> Result<Vec<Value>> {
        let path = self.file_path(bot_name, date)?;
        match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| {
                Error::CorruptData(format!("数据文件 {} 解析失败: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(
        &self,
        bot_name: &str,
        date: NaiveDate,
        records: &[Value],
    ) -> Result<()> {
        let path = self.file_path(bot_name, date)?;
        self.ensure_dir().await?;

        // 先写临时文件再重命名，避免中途失败留下半个文件
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("已写入 {} ({} 条记录)", path.display(), records.len());
        Ok(())
    }

    async fn quarantine(&self, bot_name: &str, date: NaiveDate) -> Result<String> {
        let path = self.file_path(bot_name, date)?;
        let name = format!(
            "{}.corrupt-{}",
            data_file_name(bot_name, date),
            Utc::now().timestamp_millis()
        );
        tokio::fs::rename(&path, self.dir.join(&name)).await?;
        warn!("⚠️ 数据文件 {} 已移至 {}", path.display(), name);
        Ok(name)
    }

    async fn list_files(&self, bot_name: &str) -> Result<Vec<DataFileInfo>> {
        let mut files = Vec::new();
        for (name, date, path) in self.data_files().await? {
            if name != bot_name {
                continue;
            }
            let meta = tokio::fs::metadata(&path).await?;
            let modified: DateTime<Utc> = meta.modified()?.into();
            files.push(DataFileInfo {
                date: date.format(DATE_FORMAT).to_string(),
                file: data_file_name(&name, date),
                size: meta.len(),
                modified: modified.to_rfc3339(),
            });
        }
        files.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(files)
    }

    async fn list_bots(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .data_files()
            .await?
            .into_iter()
            .map(|(name, _, _)| name)
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(bot: &str, n: i64) -> Value {
        json!({
            "botName": bot,
            "timestamp": 1_714_521_600_000i64 + n,
            "category": "general",
            "priority": "normal",
            "payload": { "n": n },
            "metadata": {},
        })
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileTelemetryStore::new(dir.path().join("bot_data"));
        assert!(store.load("alpha", day(1)).await.unwrap().is_empty());
        assert!(store.list_bots().await.unwrap().is_empty());
        assert!(store.list_files("alpha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = FileTelemetryStore::new(dir.path().join("bot_data"));
        let records = vec![record("alpha", 1), record("alpha", 2)];
        store.save("alpha", day(1), &records).await.unwrap();

        assert_eq!(store.load("alpha", day(1)).await.unwrap(), records);
        assert!(store.dir().join("alpha_2024-05-01.json").exists());
        assert!(!store.dir().join("alpha_2024-05-01.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_foreign_entries_load_as_is() {
        let dir = TempDir::new().unwrap();
        let store = FileTelemetryStore::new(dir.path());
        std::fs::write(
            dir.path().join("alpha_2024-05-01.json"),
            r#"[{"timestamp":"2024-05-01T08:00:00Z","data":{"cpu":12}}, 42]"#,
        )
        .unwrap();

        let loaded = store.load("alpha", day(1)).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["data"]["cpu"], 12);
        assert_eq!(loaded[1], json!(42));
    }

    #[tokio::test]
    async fn test_list_files_and_bots() {
        let dir = TempDir::new().unwrap();
        let store = FileTelemetryStore::new(dir.path());
        store.save("data_logger", day(1), &[record("data_logger", 1)]).await.unwrap();
        store.save("data_logger", day(3), &[record("data_logger", 2)]).await.unwrap();
        store.save("alpha", day(2), &[record("alpha", 3)]).await.unwrap();
        std::fs::write(dir.path().join("README.txt"), "ignore me").unwrap();

        let files = store.list_files("data_logger").await.unwrap();
        let dates: Vec<&str> = files.iter().map(|f| f.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-05-03", "2024-05-01"]);
        assert_eq!(files[0].file, "data_logger_2024-05-03.json");
        assert!(files[0].size > 0);

        assert_eq!(
            store.list_bots().await.unwrap(),
            vec!["alpha".to_string(), "data_logger".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rejects_unsafe_bot_name() {
        let dir = TempDir::new().unwrap();
        let store = FileTelemetryStore::new(dir.path());
        assert!(matches!(
            store.save("../escape", day(1), &[]).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(store.load("a/b", day(1)).await.is_err());
        assert!(store.save("bot@host", day(1), &[]).await.unwrap_err().is_permanent());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = FileTelemetryStore::new(dir.path());
        std::fs::write(dir.path().join("alpha_2024-05-01.json"), "[{broken").unwrap();
        std::fs::write(dir.path().join("alpha_2024-05-02.json"), r#"{"not":"a list"}"#).unwrap();

        for d in [1, 2] {
            let err = store.load("alpha", day(d)).await.unwrap_err();
            assert!(matches!(err, Error::CorruptData(_)), "{:?}", err);
        }

        let moved = store.quarantine("alpha", day(1)).await.unwrap();
        assert!(moved.starts_with("alpha_2024-05-01.json.corrupt-"));
        assert!(dir.path().join(&moved).exists());
        assert!(store.load("alpha", day(1)).await.unwrap().is_empty());

        // 移走的文件不再出现在列表中
        let files = store.list_files("alpha").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].date, "2024-05-02");
    }
}
