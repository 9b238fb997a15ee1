/// 配置管理

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    /// Bot 凭据文件（由外部工具维护，Server 只读）
    pub bot_keys_file: PathBuf,
    /// 遥测数据目录
    pub bot_data_dir: PathBuf,
    /// 遥测数据落盘间隔（分钟）
    pub bot_data_save_interval: u64,
    /// 控制面板 REST 接口的 JWT 密钥，未配置时 /api 不可用
    pub jwt_secret: Option<String>,
    /// Bot 无活动超过该秒数后强制断开，未配置则不检查
    pub heartbeat_timeout_secs: Option<u64>,
    pub heartbeat_check_interval_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: 3000,
            bot_keys_file: PathBuf::from("bot-keys.json"),
            bot_data_dir: PathBuf::from("bot_data"),
            bot_data_save_interval: 5,
            jwt_secret: None,
            heartbeat_timeout_secs: None,
            heartbeat_check_interval_secs: 30,
            log_level: "debug".to_string(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置（未设置的项使用默认值）
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg: Self = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// 校验配置取值
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bot_data_save_interval == 0 {
            anyhow::bail!("BOT_DATA_SAVE_INTERVAL 必须大于 0");
        }
        if self.heartbeat_check_interval_secs == 0 {
            anyhow::bail!("HEARTBEAT_CHECK_INTERVAL_SECS 必须大于 0");
        }
        if self.heartbeat_timeout_secs == Some(0) {
            anyhow::bail!("HEARTBEAT_TIMEOUT_SECS 必须大于 0");
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.bot_data_save_interval * 60)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_secs.map(Duration::from_secs)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_interval_secs)
    }

    /// 空字符串视为未配置
    pub fn jwt_secret(&self) -> Option<&str> {
        self.jwt_secret.as_deref().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.api_port, 3000);
        assert_eq!(cfg.flush_interval(), Duration::from_secs(300));
        assert_eq!(cfg.heartbeat_timeout(), None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let cfg = Config {
            bot_data_save_interval: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            heartbeat_timeout_secs: Some(0),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_jwt_secret_is_unset() {
        let cfg = Config {
            jwt_secret: Some(String::new()),
            ..Config::default()
        };
        assert_eq!(cfg.jwt_secret(), None);
    }
}
