/// 协议数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// 客户端角色
// ============================================================================

/// 客户端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Bot,
    Panel,
}

impl ClientType {
    /// 从 identify 消息中的 clientType 字段解析
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bot" => Some(Self::Bot),
            "panel" => Some(Self::Panel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Panel => "panel",
        }
    }
}

// ============================================================================
// 连接列表（clients_update）
// ============================================================================

/// 已连接 Bot 的摘要信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BotSummary {
    pub id: String,
    pub username: String,
    pub bot_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub connected_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
    pub authenticated: bool,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// 已连接控制面板的摘要信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PanelSummary {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub connected_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub client_type: ClientType,
}

/// 连接统计
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RosterStats {
    pub total_bots: usize,
    pub total_panels: usize,
}

/// 某一时刻的连接列表快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RosterSnapshot {
    pub bots: Vec<BotSummary>,
    pub panels: Vec<PanelSummary>,
    pub stats: RosterStats,
}

impl RosterSnapshot {
    pub fn new(bots: Vec<BotSummary>, panels: Vec<PanelSummary>) -> Self {
        let stats = RosterStats {
            total_bots: bots.len(),
            total_panels: panels.len(),
        };
        Self { bots, panels, stats }
    }

    /// 判断指定连接是否出现在列表中
    pub fn contains(&self, connection_id: &str) -> bool {
        self.bots.iter().any(|b| b.id == connection_id)
            || self.panels.iter().any(|p| p.id == connection_id)
    }
}

// ============================================================================
// 遥测数据
// ============================================================================

/// Bot 通过 generic_message 上报的一条记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub bot_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub priority: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_client_type_parse() {
        assert_eq!(ClientType::parse("bot"), Some(ClientType::Bot));
        assert_eq!(ClientType::parse("panel"), Some(ClientType::Panel));
        assert_eq!(ClientType::parse("Bot"), None);
        assert_eq!(ClientType::parse("admin"), None);
    }

    #[test]
    fn test_bot_summary_wire_shape() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let bot = BotSummary {
            id: "c1".into(),
            username: "alpha".into(),
            bot_name: "Alpha".into(),
            connected_at: at,
            client_type: ClientType::Bot,
            last_activity: at,
            authenticated: true,
            ipv4: Some("10.0.0.2".into()),
            ipv6: None,
        };
        let value = serde_json::to_value(&bot).unwrap();
        assert_eq!(value["type"], "bot");
        assert_eq!(value["botName"], "Alpha");
        assert_eq!(value["connectedAt"], 1_700_000_000_123i64);
        assert_eq!(value["lastActivity"], 1_700_000_000_123i64);
        assert_eq!(value["ipv6"], json!(null));
    }

    #[test]
    fn test_roster_stats() {
        let snapshot = RosterSnapshot::new(Vec::new(), Vec::new());
        assert_eq!(snapshot.stats, RosterStats::default());
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["stats"]["totalBots"], 0);
        assert_eq!(value["stats"]["totalPanels"], 0);
    }

    #[test]
    fn test_telemetry_record_metadata_default() {
        let record: TelemetryRecord = serde_json::from_value(json!({
            "botName": "alpha",
            "timestamp": 1_700_000_000_000i64,
            "category": "general",
            "priority": "normal",
            "payload": {"temp": 21.5}
        }))
        .unwrap();
        assert_eq!(record.metadata, serde_json::Value::Null);
        assert_eq!(record.payload["temp"], 21.5);
    }
}
