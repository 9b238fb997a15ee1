/// 工具函数集合

use chrono::{NaiveDate, Utc};
use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

/// 数据文件日期格式
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 生成带前缀的请求 ID，格式：`{prefix}_{毫秒时间戳}_{9位随机串}`
pub fn generate_request_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// 解析 YYYY-MM-DD 格式日期
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let bytes = value.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}

/// 验证 Bot 名称是否可以安全地用作文件名的一部分
pub fn is_valid_bot_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// 数据文件名：`{botName}_{YYYY-MM-DD}.json`
pub fn data_file_name(bot_name: &str, date: NaiveDate) -> String {
    format!("{}_{}.json", bot_name, date.format(DATE_FORMAT))
}

/// 从数据文件名中解析 Bot 名称与日期
///
/// Bot 名称本身可以包含下划线，因此以最后一个下划线分隔
pub fn parse_data_file_name(file_name: &str) -> Option<(String, NaiveDate)> {
    let stem = file_name.strip_suffix(".json")?;
    let (bot_name, date) = stem.rsplit_once('_')?;
    if bot_name.is_empty() {
        return None;
    }
    Some((bot_name.to_string(), parse_date(date)?))
}
