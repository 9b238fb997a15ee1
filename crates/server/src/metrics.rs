/// Prometheus 指标

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub connected_bots: IntGauge,
    pub connected_panels: IntGauge,
    pub telemetry_received: IntCounter,
    pub telemetry_flushed: IntCounter,
    pub flush_failures: IntCounter,
    pub telemetry_dropped: IntCounter,
    pub auth_rejections: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("commander".to_string()), None)?;

        let connected_bots = IntGauge::new("connected_bots", "当前已认证的 Bot 连接数")?;
        let connected_panels = IntGauge::new("connected_panels", "当前控制面板连接数")?;
        let telemetry_received =
            IntCounter::new("telemetry_records_received_total", "接收到的遥测记录数")?;
        let telemetry_flushed =
            IntCounter::new("telemetry_records_flushed_total", "已写入磁盘的遥测记录数")?;
        let flush_failures =
            IntCounter::new("telemetry_flush_failures_total", "写入失败的遥测分组数")?;
        let telemetry_dropped =
            IntCounter::new("telemetry_records_dropped_total", "无法落盘而丢弃的遥测记录数")?;
        let auth_rejections = IntCounterVec::new(
            Opts::new("auth_rejections_total", "身份识别被拒绝次数"),
            &["code"],
        )?;

        registry.register(Box::new(connected_bots.clone()))?;
        registry.register(Box::new(connected_panels.clone()))?;
        registry.register(Box::new(telemetry_received.clone()))?;
        registry.register(Box::new(telemetry_flushed.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(telemetry_dropped.clone()))?;
        registry.register(Box::new(auth_rejections.clone()))?;

        Ok(Self {
            registry,
            connected_bots,
            connected_panels,
            telemetry_received,
            telemetry_flushed,
            flush_failures,
            telemetry_dropped,
            auth_rejections,
        })
    }

    /// 以 Prometheus 文本格式导出
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let metrics = Metrics::new().unwrap();
        metrics.connected_bots.set(2);
        metrics
            .auth_rejections
            .with_label_values(&["INVALID_CREDENTIALS"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("commander_connected_bots 2"));
        assert!(text.contains("commander_auth_rejections_total{code=\"INVALID_CREDENTIALS\"} 1"));
    }
}
