/// WebSocket 连接处理器
///
/// 每个连接一个接收循环（按到达顺序处理消息）和一个发送任务（消费出站通道）

use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use common::protocol::{ClientMessage, ClientType, ServerMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::identity::IdentifyOutcome;
use super::registry::Outbound;
use crate::app_state::AppState;

/// 连接结束后等待出站队列发送完毕的最长时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket 升级处理器
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, connect_info, &headers, state)
}

/// 完成升级并启动连接处理
pub fn upgrade(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    state: AppState,
) -> Response {
    let remote = forwarded_address(headers).or(connect_info.map(|ConnectInfo(addr)| addr.ip()));
    ws.on_upgrade(move |socket| handle_connection(socket, remote, state))
}

/// 反向代理场景下优先使用 X-Forwarded-For 的第一个地址
fn forwarded_address(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

async fn handle_connection(socket: WebSocket, remote: Option<IpAddr>, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();

    // 创建消息发送通道，发送端交给注册表
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let id = state.registry.register(remote, tx).await;

    state
        .registry
        .send_to(
            &id,
            ServerMessage::IdentifyRequest {
                message: "Please identify as \"bot\" or \"panel\"".to_string(),
                client_id: id.clone(),
            },
        )
        .await;

    let mut send_task = tokio::spawn(send_loop(ws_sender, rx));

    let recv_state = state.clone();
    let recv_id = id.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut role: Option<ClientType> = None;

        while let Some(result) = ws_receiver.next().await {
            let parsed = match result {
                Ok(AxumWsMessage::Text(text)) => ClientMessage::from_json(&text),
                Ok(AxumWsMessage::Binary(data)) => ClientMessage::from_bytes(&data),
                Ok(AxumWsMessage::Close(_)) => {
                    debug!("收到关闭帧: {}", recv_id);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("接收消息错误 ({}): {}", recv_id, e);
                    break;
                }
            };

            let message = match parsed {
                Ok(message) => message,
                Err(e) => {
                    warn!("丢弃无法解析的消息 ({}): {}", recv_id, e);
                    continue;
                }
            };

            if !process_message(&recv_state, &recv_id, &mut role, message).await {
                break;
            }
        }
        debug!("消息接收任务结束: {}", recv_id);
    });

    let mut send_finished = false;
    tokio::select! {
        _ = &mut send_task => {
            debug!("发送任务已结束: {}", id);
            send_finished = true;
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("接收任务已结束: {}", id);
        }
        _ = state.shutdown.cancelled() => {
            debug!("服务关闭，断开连接: {}", id);
            state.registry.send_to(&id, Outbound::Close).await;
            recv_task.abort();
        }
    }

    // 注销后发送端被释放，发送任务处理完剩余消息后自行结束
    state.registry.unregister(&id).await;
    if !send_finished && tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        warn!("出站队列未能及时发送完毕: {}", id);
        send_task.abort();
    }
    info!("WebSocket 连接已关闭: {}", id);
}

/// 处理一条消息，返回 false 表示连接需要关闭
async fn process_message(
    state: &AppState,
    id: &str,
    role: &mut Option<ClientType>,
    message: ClientMessage,
) -> bool {
    match (*role, message) {
        (None, ClientMessage::Identify(request)) => {
            match state.identity.identify(id, request).await {
                IdentifyOutcome::Identified(client_type) => *role = Some(client_type),
                IdentifyOutcome::Unidentified => {}
                IdentifyOutcome::Rejected => {
                    state.registry.send_to(id, Outbound::Close).await;
                    return false;
                }
            }
        }
        (None, message) => {
            debug!("未识别的连接发送了 {}，已忽略: {}", message.kind(), id);
        }
        (Some(_), ClientMessage::Identify(_)) => {
            state.identity.reject_reidentify(id).await;
        }
        (Some(client_type), message) => {
            state.router.dispatch(id, client_type, message).await;
        }
    }
    true
}

/// 消费出站通道，直到通道关闭或收到 Close
async fn send_loop(
    mut ws_sender: SplitSink<WebSocket, AxumWsMessage>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        let text = match item {
            Outbound::Message(message) => match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("序列化消息失败: {}", e);
                    continue;
                }
            },
            Outbound::Relay(value) => value.to_string(),
            Outbound::Close => {
                let _ = ws_sender.send(AxumWsMessage::Close(None)).await;
                break;
            }
        };

        if let Err(e) = ws_sender.send(AxumWsMessage::Text(text)).await {
            error!("发送消息失败: {}", e);
            break;
        }
    }
    debug!("消息发送任务结束");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialVerifier, Verification};
    use crate::config::Config;
    use crate::telemetry::FileTelemetryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct StubVerifier;

    #[async_trait]
    impl CredentialVerifier for StubVerifier {
        async fn verify(&self, username: &str, secret: &str) -> common::Result<Verification> {
            Ok(match (username, secret) {
                ("alpha", "good") => Verification::Valid,
                ("alpha", _) => Verification::InvalidSecret,
                _ => Verification::NotRegistered,
            })
        }
    }

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        _dir: TempDir,
    }

    async fn start_server() -> TestServer {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(
            Config::default(),
            Arc::new(StubVerifier),
            Arc::new(FileTelemetryStore::new(dir.path())),
        )
        .unwrap();

        let app = crate::build_app(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        TestServer {
            addr,
            state,
            _dir: dir,
        }
    }

    async fn recv_json(client: &mut Client) -> Option<Value> {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .ok()??;
            match next.ok()? {
                WsMessage::Text(text) => return serde_json::from_str(&text).ok(),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// 在短时间内没有新消息
    async fn assert_silent(client: &mut Client) {
        let next = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    /// 建立连接并读取 identify_request，返回客户端和连接 ID
    async fn connect(server: &TestServer, path: &str) -> (Client, String) {
        let url = format!("ws://{}{}", server.addr, path);
        let (mut client, _) = connect_async(url).await.unwrap();
        let hello = recv_json(&mut client).await.unwrap();
        assert_eq!(hello["type"], "identify_request");
        let id = hello["clientId"].as_str().unwrap().to_string();
        (client, id)
    }

    #[tokio::test]
    async fn test_bot_authenticates_and_appears_in_roster() {
        let server = start_server().await;
        let (mut panel, _) = connect(&server, "/ws").await;
        send_json(&mut panel, json!({"type": "identify", "clientType": "panel"})).await;
        assert_eq!(recv_json(&mut panel).await.unwrap()["type"], "welcome");
        assert_eq!(recv_json(&mut panel).await.unwrap()["type"], "clients_update");

        let (mut bot, bot_id) = connect(&server, "/").await;
        send_json(
            &mut bot,
            json!({"type": "identify", "clientType": "bot", "username": "alpha", "apiKey": "good"}),
        )
        .await;
        let welcome = recv_json(&mut bot).await.unwrap();
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["authenticated"], true);

        let update = recv_json(&mut panel).await.unwrap();
        assert_eq!(update["type"], "clients_update");
        assert_eq!(update["stats"]["totalBots"], 1);
        assert_eq!(update["bots"][0]["id"], bot_id.as_str());
        assert_eq!(update["bots"][0]["authenticated"], true);
        assert_eq!(update["bots"][0]["botName"], "alpha");
        assert_eq!(update["bots"][0]["ipv4"], "127.0.0.1");

        bot.close(None).await.unwrap();
        let update = recv_json(&mut panel).await.unwrap();
        assert_eq!(update["stats"]["totalBots"], 0);
    }

    #[tokio::test]
    async fn test_rejected_bot_gets_error_then_close() {
        let server = start_server().await;
        let (mut bot, bot_id) = connect(&server, "/ws").await;
        send_json(
            &mut bot,
            json!({"type": "identify", "clientType": "bot", "username": "alpha", "apiKey": "bad"}),
        )
        .await;

        let error = recv_json(&mut bot).await.unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "INVALID_CREDENTIALS");
        assert_eq!(recv_json(&mut bot).await, None);
        assert!(!server.state.registry.snapshot().await.contains(&bot_id));
    }

    #[tokio::test]
    async fn test_unidentified_heartbeat_is_ignored() {
        let server = start_server().await;
        let (mut client, _) = connect(&server, "/ws").await;

        send_json(&mut client, json!({"type": "heartbeat"})).await;
        client.send(WsMessage::Text("not json".into())).await.unwrap();
        assert_silent(&mut client).await;

        let snapshot = server.state.registry.snapshot().await;
        assert_eq!(snapshot.stats.total_bots, 0);
        assert_eq!(snapshot.stats.total_panels, 0);

        // 连接仍然可用
        send_json(&mut client, json!({"type": "identify", "clientType": "robot"})).await;
        let error = recv_json(&mut client).await.unwrap();
        assert_eq!(error["code"], "INVALID_CLIENT_TYPE");
        send_json(&mut client, json!({"type": "identify", "clientType": "panel"})).await;
        assert_eq!(recv_json(&mut client).await.unwrap()["type"], "welcome");
    }

    #[tokio::test]
    async fn test_heartbeat_ack_and_reidentify() {
        let server = start_server().await;
        let (mut bot, _) = connect(&server, "/ws").await;
        send_json(
            &mut bot,
            json!({"type": "identify", "clientType": "bot", "username": "alpha", "apiKey": "good"}),
        )
        .await;
        assert_eq!(recv_json(&mut bot).await.unwrap()["type"], "welcome");

        send_json(&mut bot, json!({"type": "heartbeat"})).await;
        assert_eq!(recv_json(&mut bot).await.unwrap()["type"], "heartbeat_ack");

        send_json(&mut bot, json!({"type": "identify", "clientType": "panel"})).await;
        let error = recv_json(&mut bot).await.unwrap();
        assert_eq!(error["code"], "ALREADY_IDENTIFIED");
        assert_eq!(server.state.registry.snapshot().await.stats.total_bots, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let server = start_server().await;
        let (mut client, _) = connect(&server, "/ws").await;

        server.state.shutdown.cancel();
        assert_eq!(recv_json(&mut client).await, None);
    }

    #[test]
    fn test_forwarded_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_address(&headers), None);
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(forwarded_address(&headers), Some("203.0.113.7".parse().unwrap()));
    }
}
