/// 应用全局状态

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialVerifier;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::telemetry::{TelemetryBuffer, TelemetryFlusher, TelemetryStore};
use crate::ws::{ConnectionRegistry, IdentityService, MessageRouter};

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// WebSocket 连接注册表
    pub registry: ConnectionRegistry,
    pub identity: IdentityService,
    pub router: MessageRouter,
    /// 尚未落盘的遥测数据
    pub telemetry: TelemetryBuffer,
    /// 遥测数据存储（REST 接口直接读取）
    pub store: Arc<dyn TelemetryStore>,
    pub metrics: Arc<Metrics>,
    /// 进程退出信号，取消后所有连接和后台任务结束
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        verifier: Arc<dyn CredentialVerifier>,
        store: Arc<dyn TelemetryStore>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let registry = ConnectionRegistry::new(metrics.clone());
        let telemetry = TelemetryBuffer::new();

        Ok(Self {
            config: Arc::new(config),
            identity: IdentityService::new(registry.clone(), verifier, metrics.clone()),
            router: MessageRouter::new(registry.clone(), telemetry.clone(), metrics.clone()),
            registry,
            telemetry,
            store,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    /// 基于当前缓冲区和存储创建落盘器
    pub fn flusher(&self) -> TelemetryFlusher {
        TelemetryFlusher::new(self.telemetry.clone(), self.store.clone(), self.metrics.clone())
    }
}
