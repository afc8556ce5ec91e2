// WebSocket bridge
// Thin front door: origin/token gating, session resolution from WS
// sub-protocols, heartbeat, and strictly serialized per-socket message
// handling with backpressure-aware sends.

pub mod coordination;
mod frames;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ads_agents::{AgentError, AgentInput, SendOptions};
use ads_core::SessionManager;
use ads_store::{Scope, TaskStore};

pub use frames::{AgentInfo, ClientMessage, ServerFrame};

pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_FORBIDDEN: u16 = 4403;
pub const CLOSE_TOO_MANY_CLIENTS: u16 = 4409;

const SESSION_PROTOCOL_PREFIX: &str = "ads-session.";
const CHAT_PROTOCOL_PREFIX: &str = "ads-chat.";
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub auth_token: Option<String>,
    /// Empty list admits any origin (local development).
    pub allowed_origins: Vec<String>,
    pub max_clients: usize,
    pub heartbeat_ms: u64,
    pub max_missed_pongs: u32,
    pub history_limit: usize,
    pub workspace: PathBuf,
    pub namespace: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            allowed_origins: Vec::new(),
            max_clients: 32,
            heartbeat_ms: 15_000,
            max_missed_pongs: 2,
            history_limit: 50,
            workspace: PathBuf::from("."),
            namespace: "default".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct BridgeState {
    pub sessions: Arc<SessionManager>,
    pub store: Option<Arc<TaskStore>>,
    pub config: Arc<BridgeConfig>,
    clients: Arc<AtomicUsize>,
    history: Arc<RwLock<HashMap<String, Vec<ServerFrame>>>>,
}

impl BridgeState {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Option<Arc<TaskStore>>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            sessions,
            store,
            config: Arc::new(config),
            clients: Arc::new(AtomicUsize::new(0)),
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

pub fn router(state: BridgeState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

pub async fn serve(addr: SocketAddr, state: BridgeState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "websocket bridge listening");
    axum::serve(listener, router(state)).await
}

/// `(sessionId, chatSessionId)` resolved from the offered sub-protocols;
/// defaults are a random session and the `"main"` chat.
pub fn resolve_session_protocols(header: Option<&str>) -> (String, String) {
    let mut session_id = None;
    let mut chat_id = None;
    if let Some(header) = header {
        for offered in header.split(',').map(str::trim) {
            if let Some(id) = offered.strip_prefix(SESSION_PROTOCOL_PREFIX) {
                session_id.get_or_insert_with(|| id.to_string());
            } else if let Some(id) = offered.strip_prefix(CHAT_PROTOCOL_PREFIX) {
                chat_id.get_or_insert_with(|| id.to_string());
            }
        }
    }
    (
        session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        chat_id.unwrap_or_else(|| "main".to_string()),
    )
}

/// Returns the close code a new connection must be rejected with, if any.
pub fn connection_rejection(
    config: &BridgeConfig,
    origin: Option<&str>,
    bearer_token: Option<&str>,
    current_clients: usize,
) -> Option<(u16, &'static str)> {
    if !config.allowed_origins.is_empty() {
        let allowed = origin
            .map(|origin| config.allowed_origins.iter().any(|entry| entry == origin))
            .unwrap_or(false);
        if !allowed {
            return Some((CLOSE_FORBIDDEN, "forbidden"));
        }
    }
    if let Some(expected) = &config.auth_token {
        if bearer_token != Some(expected.as_str()) {
            return Some((CLOSE_UNAUTHORIZED, "unauthorized"));
        }
    }
    if current_clients >= config.max_clients {
        return Some((CLOSE_TOO_MANY_CLIENTS, "too many clients"));
    }
    None
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn ws_handler(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers
        .get("origin")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bearer = bearer_from_headers(&headers);
    let protocols = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let (session_id, chat_id) = resolve_session_protocols(protocols.as_deref());

    let rejection = connection_rejection(
        &state.config,
        origin.as_deref(),
        bearer.as_deref(),
        state.clients.load(Ordering::SeqCst),
    );

    let offered: Vec<String> = protocols
        .as_deref()
        .map(|header| header.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    ws.protocols(offered)
        .on_upgrade(move |socket| handle_socket(socket, state, session_id, chat_id, rejection))
}

struct ClientGuard(Arc<AtomicUsize>);

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(WsMessage::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    state: BridgeState,
    session_id: String,
    chat_id: String,
    rejection: Option<(u16, &'static str)>,
) {
    if let Some((code, reason)) = rejection {
        tracing::warn!(code, reason, "rejecting websocket connection");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
        return;
    }
    state.clients.fetch_add(1, Ordering::SeqCst);
    let _guard = ClientGuard(state.clients.clone());

    let user_id = format!("{session_id}::{chat_id}");
    let session = state
        .sessions
        .get_or_create(&user_id, state.config.workspace.clone(), true)
        .await;

    // Welcome, agent roster, then history replay.
    let welcome = ServerFrame::Welcome {
        session_id: session_id.clone(),
        chat_session_id: chat_id.clone(),
    };
    if !send_frame(&mut socket, &welcome).await {
        return;
    }
    let agents = session
        .orchestrator
        .statuses()
        .await
        .into_iter()
        .map(|(descriptor, status)| frames::AgentInfo { descriptor, status })
        .collect();
    if !send_frame(&mut socket, &ServerFrame::Agents { agents }).await {
        return;
    }
    let replay = state
        .history
        .read()
        .await
        .get(&user_id)
        .cloned()
        .unwrap_or_default();
    for frame in &replay {
        if !send_frame(&mut socket, frame).await {
            return;
        }
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CAPACITY);
    let in_flight: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

    // Event pump: orchestrator broadcast → outbound frames. A full outbound
    // queue means the consumer is not keeping up; the pump stops and the
    // heartbeat will reap the socket.
    let pump = {
        let mut events = session.orchestrator.subscribe();
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if outbound_tx
                    .try_send(ServerFrame::Event { event })
                    .is_err()
                {
                    tracing::warn!("outbound queue full; stopping event pump");
                    break;
                }
            }
        })
    };

    // Worker: prompts and commands handled strictly in arrival order.
    let (work_tx, mut work_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_CAPACITY);
    let worker = {
        let state = state.clone();
        let outbound_tx = outbound_tx.clone();
        let in_flight = in_flight.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            while let Some(message) = work_rx.recv().await {
                let frame =
                    handle_work_message(&state, &user_id, message, &in_flight).await;
                let _ = outbound_tx.send(frame.clone()).await;
                push_history(&state, &user_id, frame).await;
            }
        })
    };

    let mut heartbeat = tokio::time::interval(Duration::from_millis(
        state.config.heartbeat_ms.max(100),
    ));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if !send_frame(&mut socket, &frame).await {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= state.config.max_missed_pongs {
                    tracing::info!(user = %user_id, "closing socket: missed pongs");
                    break;
                }
                missed_pongs += 1;
                if !send_frame(&mut socket, &ServerFrame::Ping).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let WsMessage::Text(text) = message else { continue };
                let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
                match parsed {
                    Ok(ClientMessage::Ping) => {
                        if !send_frame(&mut socket, &ServerFrame::Pong).await {
                            break;
                        }
                    }
                    Ok(ClientMessage::Pong) => {
                        missed_pongs = 0;
                    }
                    Ok(ClientMessage::Interrupt) => {
                        if let Some(cancel) = in_flight.lock().await.as_ref() {
                            cancel.cancel();
                        }
                    }
                    Ok(ClientMessage::ClearHistory) => {
                        state.history.write().await.remove(&user_id);
                    }
                    Ok(message) => {
                        if work_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // The error frame is reserved for protocol violations.
                        let frame = ServerFrame::Error {
                            message: format!("invalid message: {err}"),
                        };
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    pump.abort();
    if let Some(cancel) = in_flight.lock().await.take() {
        cancel.cancel();
    }
    drop(work_tx);
    let _ = worker.await;
}

async fn push_history(state: &BridgeState, user_id: &str, frame: ServerFrame) {
    let mut history = state.history.write().await;
    let entries = history.entry(user_id.to_string()).or_default();
    entries.push(frame);
    let limit = state.config.history_limit;
    if entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(..excess);
    }
}

async fn handle_work_message(
    state: &BridgeState,
    user_id: &str,
    message: ClientMessage,
    in_flight: &Arc<Mutex<Option<CancellationToken>>>,
) -> ServerFrame {
    match message {
        ClientMessage::Prompt { text, agent } => {
            let cancel = CancellationToken::new();
            *in_flight.lock().await = Some(cancel.clone());

            if let Some(agent) = agent {
                if let Err(err) = state.sessions.switch_agent(user_id, &agent).await {
                    in_flight.lock().await.take();
                    return ServerFrame::Result {
                        response: err.to_string(),
                        agent_id: None,
                        ok: false,
                    };
                }
            }

            let result = state
                .sessions
                .send(
                    user_id,
                    state.config.workspace.clone(),
                    AgentInput::Text(text),
                    SendOptions {
                        streaming: true,
                        cancel: cancel.clone(),
                        output_schema: None,
                    },
                )
                .await;

            let frame = match result {
                Ok(reply) => {
                    // A supervisor reply carrying delegation blocks kicks off
                    // the coordination loop before anything reaches the user.
                    let response = match &state.store {
                        Some(store) => {
                            let session = state
                                .sessions
                                .get_or_create(user_id, state.config.workspace.clone(), true)
                                .await;
                            coordination::coordinate_reply(
                                state.sessions.config(),
                                session.orchestrator.clone(),
                                store.clone(),
                                &state.config.namespace,
                                user_id,
                                &reply.response,
                                cancel,
                            )
                            .await
                        }
                        None => reply.response,
                    };
                    ServerFrame::Result {
                        response,
                        agent_id: Some(reply.agent_id),
                        ok: true,
                    }
                }
                Err(AgentError::Cancelled) => ServerFrame::Result {
                    response: "aborted".to_string(),
                    agent_id: None,
                    ok: false,
                },
                Err(err) => ServerFrame::Result {
                    response: err.to_string(),
                    agent_id: None,
                    ok: false,
                },
            };
            in_flight.lock().await.take();
            frame
        }
        ClientMessage::Command { name, args } => run_command(state, user_id, &name, &args).await,
        ClientMessage::TaskResume { task_id } => resume_tasks(state, user_id, task_id).await,
        // ping/pong/interrupt/clear_history are handled on the socket loop.
        _ => ServerFrame::Error {
            message: "unexpected message in work queue".to_string(),
        },
    }
}

async fn run_command(
    state: &BridgeState,
    user_id: &str,
    name: &str,
    args: &[String],
) -> ServerFrame {
    match name {
        "switch_agent" => match args.first() {
            Some(target) => match state.sessions.switch_agent(user_id, target).await {
                Ok(id) => ServerFrame::Result {
                    response: format!("active agent is now {id}"),
                    agent_id: Some(id),
                    ok: true,
                },
                Err(err) => ServerFrame::Result {
                    response: err.to_string(),
                    agent_id: None,
                    ok: false,
                },
            },
            None => ServerFrame::Error {
                message: "switch_agent requires an agent id".to_string(),
            },
        },
        "set_cwd" => match args.first() {
            Some(path) => {
                state
                    .sessions
                    .set_user_cwd(user_id, PathBuf::from(path))
                    .await;
                ServerFrame::Result {
                    response: format!("working directory set to {path}"),
                    agent_id: None,
                    ok: true,
                }
            }
            None => ServerFrame::Error {
                message: "set_cwd requires a path".to_string(),
            },
        },
        "reset" => {
            state.sessions.reset(user_id).await;
            ServerFrame::Result {
                response: "session reset".to_string(),
                agent_id: None,
                ok: true,
            }
        }
        other => ServerFrame::Error {
            message: format!("unknown command `{other}`"),
        },
    }
}

async fn resume_tasks(
    state: &BridgeState,
    user_id: &str,
    task_id: Option<String>,
) -> ServerFrame {
    let Some(store) = &state.store else {
        return ServerFrame::Result {
            response: "task store unavailable".to_string(),
            agent_id: None,
            ok: false,
        };
    };
    let scope = Scope::new(state.config.namespace.clone(), user_id.to_string());
    match store.list_tasks(&scope, true).await {
        Ok(tasks) => {
            let filtered: Vec<_> = tasks
                .into_iter()
                .filter(|task| {
                    task_id
                        .as_deref()
                        .map(|wanted| task.task_id == wanted)
                        .unwrap_or(true)
                })
                .collect();
            if filtered.is_empty() {
                return ServerFrame::Result {
                    response: "no resumable tasks".to_string(),
                    agent_id: None,
                    ok: true,
                };
            }
            let lines: Vec<String> = filtered
                .iter()
                .map(|task| {
                    format!(
                        "{} [{}] agent={} rev={}",
                        task.task_id,
                        task.status.as_str(),
                        task.agent_id,
                        task.revision
                    )
                })
                .collect();
            ServerFrame::Result {
                response: lines.join("\n"),
                agent_id: None,
                ok: true,
            }
        }
        Err(err) => ServerFrame::Result {
            response: err.to_string(),
            agent_id: None,
            ok: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocols_resolve_ids() {
        let (session, chat) =
            resolve_session_protocols(Some("ads-session.s1, ads-chat.c2, other"));
        assert_eq!(session, "s1");
        assert_eq!(chat, "c2");
    }

    #[test]
    fn missing_subprotocols_get_defaults() {
        let (session, chat) = resolve_session_protocols(None);
        assert!(!session.is_empty());
        assert_eq!(chat, "main");
    }

    #[test]
    fn rejection_codes_follow_the_contract() {
        let config = BridgeConfig {
            auth_token: Some("secret".to_string()),
            allowed_origins: vec!["https://app.example.com".to_string()],
            max_clients: 1,
            ..Default::default()
        };
        // Bad origin wins first.
        assert_eq!(
            connection_rejection(&config, Some("https://evil.example.com"), Some("secret"), 0),
            Some((CLOSE_FORBIDDEN, "forbidden"))
        );
        // Then the bearer token.
        assert_eq!(
            connection_rejection(&config, Some("https://app.example.com"), Some("wrong"), 0),
            Some((CLOSE_UNAUTHORIZED, "unauthorized"))
        );
        assert_eq!(
            connection_rejection(&config, Some("https://app.example.com"), None, 0),
            Some((CLOSE_UNAUTHORIZED, "unauthorized"))
        );
        // Then client capacity.
        assert_eq!(
            connection_rejection(&config, Some("https://app.example.com"), Some("secret"), 1),
            Some((CLOSE_TOO_MANY_CLIENTS, "too many clients"))
        );
        assert_eq!(
            connection_rejection(&config, Some("https://app.example.com"), Some("secret"), 0),
            None
        );
    }

    #[test]
    fn open_config_admits_anonymous_local_clients() {
        let config = BridgeConfig::default();
        assert_eq!(connection_rejection(&config, None, None, 0), None);
    }

    #[test]
    fn client_messages_parse_by_kind() {
        let parsed: ClientMessage =
            serde_json::from_str("{\"type\":\"prompt\",\"text\":\"hi\"}").unwrap();
        assert!(matches!(parsed, ClientMessage::Prompt { ref text, .. } if text == "hi"));

        let parsed: ClientMessage = serde_json::from_str("{\"type\":\"interrupt\"}").unwrap();
        assert!(matches!(parsed, ClientMessage::Interrupt));

        assert!(serde_json::from_str::<ClientMessage>("{\"type\":\"bogus\"}").is_err());
    }
}
