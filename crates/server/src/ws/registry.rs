/// 连接注册表
///
/// 保存所有 WebSocket 连接及其角色，是"当前有谁在线"的唯一来源。
/// 改变在线列表的操作会在同一把写锁内向所有控制面板推送 clients_update。

use chrono::{DateTime, Utc};
use common::protocol::{BotSummary, ClientType, PanelSummary, RosterSnapshot, ServerMessage};
use common::utils::generate_id;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// 连接 ID
pub type ConnectionId = String;

/// 发往某个连接的出站内容
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Server 生成的消息
    Message(ServerMessage),
    /// 原样转发的 JSON
    Relay(serde_json::Value),
    /// 发送关闭帧并结束连接
    Close,
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Self::Message(msg)
    }
}

/// Bot 身份信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    /// 凭据用户名，也是遥测数据的分组名
    pub username: String,
    /// 展示名称
    pub display_name: String,
}

/// 已识别连接的角色
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Bot(BotIdentity),
    Panel,
}

impl Role {
    pub fn client_type(&self) -> ClientType {
        match self {
            Self::Bot(_) => ClientType::Bot,
            Self::Panel => ClientType::Panel,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("连接不存在: {0}")]
    NotFound(ConnectionId),

    #[error("连接 {0} 已识别为 {1}")]
    RoleAlreadySet(ConnectionId, &'static str),
}

/// 单个连接
struct ConnectionEntry {
    id: ConnectionId,
    role: Option<Role>,
    authenticated: bool,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    remote_address: Option<IpAddr>,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionEntry {
    fn client_type(&self) -> Option<ClientType> {
        self.role.as_ref().map(Role::client_type)
    }

    fn send(&self, item: Outbound) -> bool {
        if self.sender.send(item).is_err() {
            debug!("连接 {} 的发送通道已关闭", self.id);
            return false;
        }
        true
    }

    fn address_fields(&self) -> (Option<String>, Option<String>) {
        match self.remote_address {
            Some(IpAddr::V4(v4)) => (Some(v4.to_string()), None),
            Some(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => (Some(v4.to_string()), None),
                None => (None, Some(v6.to_string())),
            },
            None => (None, None),
        }
    }
}

type ConnectionMap = HashMap<ConnectionId, ConnectionEntry>;

/// 连接注册表
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<ConnectionMap>>,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    /// 登记新连接（尚未识别身份，不出现在在线列表中）
    pub async fn register(
        &self,
        remote_address: Option<IpAddr>,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> ConnectionId {
        let id = generate_id();
        let now = Utc::now();
        let entry = ConnectionEntry {
            id: id.clone(),
            role: None,
            authenticated: false,
            connected_at: now,
            last_activity: now,
            remote_address,
            sender,
        };

        let mut connections = self.connections.write().await;
        connections.insert(id.clone(), entry);
        info!("新连接已登记: {} ({:?})", id, remote_address);
        id
    }

    /// 设置连接角色，每个连接只能设置一次
    pub async fn set_role(&self, id: &str, role: Role) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        let entry = connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(current) = entry.client_type() {
            warn!("连接 {} 已识别为 {}，忽略重复设置", id, current.as_str());
            return Err(RegistryError::RoleAlreadySet(id.to_string(), current.as_str()));
        }

        entry.authenticated = matches!(role, Role::Bot(_));
        entry.last_activity = Utc::now();
        match &role {
            Role::Bot(identity) => info!(
                "✅ Bot 已认证: {} ({}) [{}]",
                identity.display_name, identity.username, id
            ),
            Role::Panel => info!("控制面板已连接: {}", id),
        }
        entry.role = Some(role);

        self.broadcast_roster(&connections);
        Ok(())
    }

    /// 刷新连接的最后活动时间
    pub async fn touch(&self, id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(id) {
            Some(entry) => {
                entry.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// 注销连接，已识别的连接被移除时推送在线列表
    pub async fn unregister(&self, id: &str) -> Option<ClientType> {
        let mut connections = self.connections.write().await;
        let entry = connections.remove(id)?;

        let client_type = entry.client_type();
        match &entry.role {
            Some(Role::Bot(identity)) => {
                info!("Bot 已断开: {} ({})", identity.display_name, id)
            }
            Some(Role::Panel) => info!("控制面板已断开: {}", id),
            None => info!("未识别的连接已断开: {}", id),
        }

        if client_type.is_some() {
            self.broadcast_roster(&connections);
        }
        client_type
    }

    /// 在线列表快照
    pub async fn snapshot(&self) -> RosterSnapshot {
        let connections = self.connections.read().await;
        build_snapshot(&connections)
    }

    /// 当前连接总数（包括未识别的连接）
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 查询连接角色，未识别或不存在时返回 None
    pub async fn role_of(&self, id: &str) -> Option<ClientType> {
        let connections = self.connections.read().await;
        connections.get(id).and_then(ConnectionEntry::client_type)
    }

    /// 查询 Bot 的用户名
    pub async fn bot_username(&self, id: &str) -> Option<String> {
        let connections = self.connections.read().await;
        match connections.get(id).and_then(|e| e.role.as_ref()) {
            Some(Role::Bot(identity)) => Some(identity.username.clone()),
            _ => None,
        }
    }

    /// 向指定连接发送
    pub async fn send_to(&self, id: &str, item: impl Into<Outbound>) -> bool {
        let connections = self.connections.read().await;
        connections.get(id).is_some_and(|entry| entry.send(item.into()))
    }

    /// 仅当目标是已连接的 Bot 时发送
    pub async fn send_to_bot(&self, id: &str, item: impl Into<Outbound>) -> bool {
        let connections = self.connections.read().await;
        match connections.get(id) {
            Some(entry) if entry.client_type() == Some(ClientType::Bot) => entry.send(item.into()),
            _ => false,
        }
    }

    /// 向所有控制面板广播，返回成功投递的数量
    pub async fn broadcast_to_panels(&self, item: impl Into<Outbound>) -> usize {
        let item = item.into();
        let connections = self.connections.read().await;
        let count = send_to_panels(&connections, &item);
        debug!("消息已广播到 {} 个控制面板", count);
        count
    }

    /// 超过 timeout 没有活动的 Bot 连接
    pub async fn idle_bots(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Utc::now();
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|entry| entry.client_type() == Some(ClientType::Bot))
            .filter(|entry| {
                (now - entry.last_activity)
                    .to_std()
                    .map_or(timeout.is_zero(), |elapsed| elapsed >= timeout)
            })
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// 启动 Bot 心跳超时检查任务，超时的连接会被关闭
    pub fn start_idle_monitor(
        self,
        timeout: Duration,
        check_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for id in self.idle_bots(timeout).await {
                            warn!("Bot 心跳超时，关闭连接: {} ({}秒)", id, timeout.as_secs());
                            self.send_to(&id, Outbound::Close).await;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// 在持有锁的情况下计算快照并推送给所有控制面板
    fn broadcast_roster(&self, connections: &ConnectionMap) {
        let snapshot = build_snapshot(connections);
        self.metrics.connected_bots.set(snapshot.stats.total_bots as i64);
        self.metrics.connected_panels.set(snapshot.stats.total_panels as i64);

        let count = send_to_panels(
            connections,
            &Outbound::Message(ServerMessage::ClientsUpdate(snapshot)),
        );
        debug!("在线列表已推送到 {} 个控制面板", count);
    }
}

fn send_to_panels(connections: &ConnectionMap, item: &Outbound) -> usize {
    connections
        .values()
        .filter(|entry| entry.client_type() == Some(ClientType::Panel))
        .filter(|entry| entry.send(item.clone()))
        .count()
}

fn build_snapshot(connections: &ConnectionMap) -> RosterSnapshot {
    let mut entries: Vec<&ConnectionEntry> = connections.values().collect();
    entries.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));

    let mut bots = Vec::new();
    let mut panels = Vec::new();
    for entry in entries {
        match &entry.role {
            Some(Role::Bot(identity)) => {
                let (ipv4, ipv6) = entry.address_fields();
                bots.push(BotSummary {
                    id: entry.id.clone(),
                    username: identity.username.clone(),
                    bot_name: identity.display_name.clone(),
                    connected_at: entry.connected_at,
                    client_type: ClientType::Bot,
                    last_activity: entry.last_activity,
                    authenticated: entry.authenticated,
                    ipv4,
                    ipv6,
                });
            }
            Some(Role::Panel) => panels.push(PanelSummary {
                id: entry.id.clone(),
                connected_at: entry.connected_at,
                client_type: ClientType::Panel,
            }),
            None => {}
        }
    }
    RosterSnapshot::new(bots, panels)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(Metrics::new().unwrap()))
    }

    pub(crate) fn bot(username: &str) -> Role {
        Role::Bot(BotIdentity {
            username: username.to_string(),
            display_name: username.to_uppercase(),
        })
    }

    pub(crate) async fn connect(
        registry: &ConnectionRegistry,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(Some("127.0.0.1".parse().unwrap()), tx).await;
        (id, rx)
    }

    /// 取出通道中已有的全部出站内容
    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn roster_updates(items: &[Outbound]) -> Vec<RosterSnapshot> {
        items
            .iter()
            .filter_map(|item| match item {
                Outbound::Message(ServerMessage::ClientsUpdate(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unidentified_not_in_roster() {
        let registry = registry();
        let (id, _rx) = connect(&registry).await;

        let snapshot = registry.snapshot().await;
        assert!(!snapshot.contains(&id));
        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.role_of(&id).await, None);
    }

    #[tokio::test]
    async fn test_set_role_broadcasts_to_panels() {
        let registry = registry();
        let (panel, mut panel_rx) = connect(&registry).await;
        let (bot_id, mut bot_rx) = connect(&registry).await;

        registry.set_role(&panel, Role::Panel).await.unwrap();
        let updates = roster_updates(&drain(&mut panel_rx));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].stats.total_panels, 1);

        registry.set_role(&bot_id, bot("alpha")).await.unwrap();
        let updates = roster_updates(&drain(&mut panel_rx));
        assert_eq!(updates.len(), 1);
        let summary = &updates[0].bots[0];
        assert_eq!(summary.id, bot_id);
        assert_eq!(summary.username, "alpha");
        assert_eq!(summary.bot_name, "ALPHA");
        assert!(summary.authenticated);
        assert_eq!(summary.ipv4.as_deref(), Some("127.0.0.1"));

        // Bot 不接收在线列表
        assert!(drain(&mut bot_rx).is_empty());
        assert_eq!(registry.metrics.connected_bots.get(), 1);
    }

    #[tokio::test]
    async fn test_role_is_one_shot() {
        let registry = registry();
        let (id, _rx) = connect(&registry).await;
        registry.set_role(&id, Role::Panel).await.unwrap();

        assert_eq!(
            registry.set_role(&id, bot("alpha")).await,
            Err(RegistryError::RoleAlreadySet(id.clone(), "panel"))
        );
        assert_eq!(registry.role_of(&id).await, Some(ClientType::Panel));
        assert_eq!(
            registry.set_role("missing", Role::Panel).await,
            Err(RegistryError::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_idempotent() {
        let registry = registry();
        let (a, _ra) = connect(&registry).await;
        let (b, _rb) = connect(&registry).await;
        let (c, _rc) = connect(&registry).await;
        registry.set_role(&a, bot("alpha")).await.unwrap();
        registry.set_role(&b, Role::Panel).await.unwrap();
        registry.set_role(&c, bot("beta")).await.unwrap();

        let first = registry.snapshot().await;
        let second = registry.snapshot().await;
        assert_eq!(first, second);
        assert_eq!(first.stats.total_bots, 2);
        assert_eq!(first.stats.total_panels, 1);
    }

    #[tokio::test]
    async fn test_unregister_broadcasts_only_for_identified() {
        let registry = registry();
        let (panel, mut panel_rx) = connect(&registry).await;
        registry.set_role(&panel, Role::Panel).await.unwrap();
        let (anon, _anon_rx) = connect(&registry).await;
        let (bot_id, _bot_rx) = connect(&registry).await;
        registry.set_role(&bot_id, bot("alpha")).await.unwrap();
        drain(&mut panel_rx);

        assert_eq!(registry.unregister(&anon).await, None);
        assert!(drain(&mut panel_rx).is_empty());

        assert_eq!(registry.unregister(&bot_id).await, Some(ClientType::Bot));
        let updates = roster_updates(&drain(&mut panel_rx));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].bots.is_empty());
        assert_eq!(registry.unregister(&bot_id).await, None);
    }

    #[tokio::test]
    async fn test_send_to_bot_requires_bot_role() {
        let registry = registry();
        let (panel, mut panel_rx) = connect(&registry).await;
        let (bot_id, mut bot_rx) = connect(&registry).await;
        let (anon, mut anon_rx) = connect(&registry).await;
        registry.set_role(&panel, Role::Panel).await.unwrap();
        registry.set_role(&bot_id, bot("alpha")).await.unwrap();
        drain(&mut panel_rx);

        assert!(registry.send_to_bot(&bot_id, ServerMessage::HeartbeatAck).await);
        assert!(!registry.send_to_bot(&panel, ServerMessage::HeartbeatAck).await);
        assert!(!registry.send_to_bot(&anon, ServerMessage::HeartbeatAck).await);
        assert!(!registry.send_to_bot("ghost", ServerMessage::HeartbeatAck).await);

        assert_eq!(drain(&mut bot_rx).len(), 1);
        assert!(drain(&mut panel_rx).is_empty());
        assert!(drain(&mut anon_rx).is_empty());
    }

    #[tokio::test]
    async fn test_ipv4_mapped_address() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry
            .register(Some("::ffff:10.1.2.3".parse().unwrap()), tx)
            .await;
        registry.set_role(&id, bot("alpha")).await.unwrap();
        let (tx6, _rx6) = mpsc::unbounded_channel();
        let id6 = registry.register(Some("2001:db8::1".parse().unwrap()), tx6).await;
        registry.set_role(&id6, bot("beta")).await.unwrap();

        let snapshot = registry.snapshot().await;
        let v4 = snapshot.bots.iter().find(|b| b.id == id).unwrap();
        assert_eq!(v4.ipv4.as_deref(), Some("10.1.2.3"));
        let v6 = snapshot.bots.iter().find(|b| b.id == id6).unwrap();
        assert_eq!(v6.ipv6.as_deref(), Some("2001:db8::1"));
        assert_eq!(v6.ipv4, None);
    }

    #[tokio::test]
    async fn test_idle_bots() {
        let registry = registry();
        let (bot_id, _rx) = connect(&registry).await;
        let (panel, _prx) = connect(&registry).await;
        registry.set_role(&bot_id, bot("alpha")).await.unwrap();
        registry.set_role(&panel, Role::Panel).await.unwrap();

        assert_eq!(registry.idle_bots(Duration::ZERO).await, vec![bot_id.clone()]);
        assert!(registry.idle_bots(Duration::from_secs(3600)).await.is_empty());
        assert!(registry.touch(&bot_id).await);
        assert!(!registry.touch("ghost").await);
    }

    #[tokio::test]
    async fn test_idle_monitor_closes_silent_bots() {
        let registry = registry();
        let (bot_id, mut bot_rx) = connect(&registry).await;
        registry.set_role(&bot_id, bot("alpha")).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = registry.clone().start_idle_monitor(
            Duration::ZERO,
            Duration::from_millis(10),
            shutdown.clone(),
        );

        let item = tokio::time::timeout(Duration::from_secs(5), bot_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Outbound::Close));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
