//! Avatar-tool connection manager
//!
//! Unlike the compositor, the avatar tool pushes unsolicited messages
//! after authentication (hotkey-list updates, permission notices), so a
//! persistent read loop runs next to request/response. Authentication is
//! a credential-exchange handshake: a persisted token is replayed when
//! present, issued and persisted when absent, and cleared and re-issued
//! when the remote party rejects it, all within one connection attempt.
//!
//! The read loop runs until the socket dies, then settles the manager
//! into `Disconnected`; it never reconnects on its own. `start()` is the
//! only way back, and a data request from the dashboard counts as a
//! legitimate reason to call it.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::events::{Event, PushBody, PushUpdate, SharedSink, StatusKind, StatusUpdate, Surface};
use crate::protocol::{Request, Response};
use crate::surface::{ConnectionConfig, ConnectionState, ControlSurface, StateCell};
use crate::types::{Result, StagehandError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WriteHalf = SplitSink<WsStream, Message>;
type ReadHalf = SplitStream<WsStream>;

/// Plugin identity presented during the credential handshake.
const PLUGIN_NAME: &str = "Stagehand";
const PLUGIN_DEVELOPER: &str = "Stagehand Project";

/// How long one receive poll blocks before re-checking the running flag.
const RECV_POLL: Duration = Duration::from_secs(1);

/// Pause before re-entering the auth flow when the remote API reports
/// itself not ready yet.
const API_NOT_READY_BACKOFF: Duration = Duration::from_secs(2);

/// The remote API is still starting up; authentication will succeed later
/// on the same socket.
const ERR_API_NOT_READY: i64 = 1;

/// The operator has not yet approved this plugin inside the avatar tool.
const ERR_PERMISSION_PENDING: i64 = 100;

/// One triggerable hotkey, as reported by the avatar tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotkey {
    #[serde(rename = "hotkeyID")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    #[serde(rename = "authenticationToken")]
    authentication_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthVerdict {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct HotkeyList {
    #[serde(rename = "availableHotkeys", default)]
    available_hotkeys: Vec<Hotkey>,
}

/// Avatar-tool connection manager. Cheap to clone; clones share one
/// connection and one state.
#[derive(Clone)]
pub struct AvatarManager {
    config: ConnectionConfig,
    store: CredentialStore,
    state: StateCell,
    writer: Arc<Mutex<Option<WriteHalf>>>,
    hotkeys: Arc<StdMutex<Vec<Hotkey>>>,
    worker: Arc<StdMutex<Option<JoinHandle<()>>>>,
    running: Arc<AtomicBool>,
    sink: SharedSink,
}

impl AvatarManager {
    pub fn new(config: ConnectionConfig, store: CredentialStore, sink: SharedSink) -> Self {
        Self {
            config,
            store,
            state: StateCell::new(Surface::Avatar),
            writer: Arc::new(Mutex::new(None)),
            hotkeys: Arc::new(StdMutex::new(Vec::new())),
            worker: Arc::new(StdMutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Launch a connection attempt in the background. No-op while a
    /// previous attempt's worker is still alive, so overlapping callers
    /// cannot race two connections onto shared state.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        self.running.store(true, Ordering::SeqCst);
        let manager = self.clone();
        *worker = Some(tokio::spawn(async move {
            connection_loop(manager).await;
        }));
    }

    /// Close the socket and join the worker. The closed socket unblocks
    /// the read loop, which drives the normal disconnect path.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(writer) = self.writer.lock().await.as_mut() {
            let _ = writer.close().await;
        }
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fire-and-forget hotkey trigger. No-op unless authenticated and the
    /// id is non-empty; send failures are swallowed. If the socket is
    /// dead, the read loop is what reports the disconnect.
    pub async fn trigger_hotkey(&self, hotkey_id: &str) {
        if hotkey_id.is_empty() || self.state.get() != ConnectionState::Authenticated {
            return;
        }
        if let Err(e) = self
            .send_request("HotkeyTriggerRequest", Some(json!({ "hotkeyID": hotkey_id })))
            .await
        {
            debug!(error = %e, "hotkey trigger send failed");
        }
    }

    /// Last known hotkey list. Never blocks; empty is a valid answer.
    pub fn cached_hotkeys(&self) -> Vec<Hotkey> {
        lock(&self.hotkeys).clone()
    }

    /// Ask for a fresh hotkey list. When not authenticated this becomes a
    /// reconnect attempt instead: for this target, a data request from
    /// the dashboard is itself a reconnect trigger.
    pub async fn request_hotkey_refresh(&self) {
        if self.state.get() == ConnectionState::Authenticated {
            if let Err(e) = self.send_request("HotkeysInCurrentModelRequest", None).await {
                debug!(error = %e, "hotkey refresh send failed");
            }
        } else {
            self.start();
        }
    }

    /// Serialize one request onto the socket. Handshake sends and command
    /// sends all pass through here, under the same writer lock.
    async fn send_request(&self, message_type: &str, data: Option<Value>) -> Result<()> {
        let encoded = Request::new(message_type, data).encode()?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.send(Message::Text(encoded)).await.map_err(Into::into),
            None => Err(StagehandError::WebSocket("no open connection".into())),
        }
    }

    /// Open the auth flow: replay the persisted credential when one
    /// exists, otherwise ask the remote party to issue one. The store is
    /// re-read on every entry.
    async fn begin_auth_flow(&self) -> Result<()> {
        match self.store.load() {
            Some(token) => self.send_authentication(&token).await,
            None => {
                self.send_request(
                    "AuthenticationTokenRequest",
                    Some(json!({
                        "pluginName": PLUGIN_NAME,
                        "pluginDeveloper": PLUGIN_DEVELOPER,
                    })),
                )
                .await
            }
        }
    }

    async fn send_authentication(&self, token: &str) -> Result<()> {
        self.send_request(
            "AuthenticationRequest",
            Some(json!({
                "pluginName": PLUGIN_NAME,
                "pluginDeveloper": PLUGIN_DEVELOPER,
                "authenticationToken": token,
            })),
        )
        .await
    }

    /// Auth flow plus read loop; returns when the socket dies or the
    /// manager is stopped.
    async fn run_session(&self, mut read: ReadHalf) {
        if let Err(e) = self.begin_auth_flow().await {
            warn!(error = %e, "avatar handshake send failed");
            return;
        }
        self.state.set(ConnectionState::Authenticating);

        while self.running.load(Ordering::SeqCst) {
            match timeout(RECV_POLL, read.next()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "avatar read failed");
                    break;
                }
                Ok(Some(Ok(Message::Text(raw)))) => {
                    if let Err(e) = self.handle_message(&raw).await {
                        warn!(error = %e, "avatar message handling failed");
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Dispatch one inbound message by its discriminator. Send failures
    /// bubble up to the read loop as log lines; the loop itself only
    /// exits on receive failure.
    async fn handle_message(&self, raw: &str) -> Result<()> {
        let message = Response::decode(raw)?;
        match message.message_type.as_str() {
            "AuthenticationTokenResponse" => {
                let grant: TokenGrant = serde_json::from_value(message.data)?;
                if let Err(e) = self.store.save(&grant.authentication_token) {
                    // The in-memory token still carries this session.
                    warn!(error = %e, "issued credential could not be persisted");
                }
                self.send_authentication(&grant.authentication_token).await
            }
            "AuthenticationResponse" => {
                let verdict: AuthVerdict =
                    serde_json::from_value(message.data).unwrap_or_default();
                if verdict.authenticated {
                    self.state.set(ConnectionState::Authenticated);
                    info!("avatar tool authenticated");
                    self.emit_status(StatusKind::Connected, "avatar tool connected".into());
                    self.send_request("HotkeysInCurrentModelRequest", None).await
                } else {
                    debug!(reason = %verdict.reason, "avatar credential rejected");
                    self.store.clear();
                    self.send_request(
                        "AuthenticationTokenRequest",
                        Some(json!({
                            "pluginName": PLUGIN_NAME,
                            "pluginDeveloper": PLUGIN_DEVELOPER,
                        })),
                    )
                    .await
                }
            }
            "HotkeysInCurrentModelResponse" => {
                let list: HotkeyList = serde_json::from_value(message.data)?;
                *lock(&self.hotkeys) = list.available_hotkeys.clone();
                self.sink.notify(Event::Push(PushUpdate {
                    surface: Surface::Avatar,
                    body: PushBody::Hotkeys(list.available_hotkeys),
                }));
                Ok(())
            }
            "APIError" => {
                let err = message.api_error().unwrap_or_default();
                match err.error_id {
                    ERR_PERMISSION_PENDING => {
                        self.emit_status(
                            StatusKind::AwaitingApproval,
                            "approve the plugin inside the avatar tool".into(),
                        );
                        Ok(())
                    }
                    ERR_API_NOT_READY => {
                        self.emit_status(
                            StatusKind::AwaitingApproval,
                            "avatar tool API not ready yet".into(),
                        );
                        sleep(API_NOT_READY_BACKOFF).await;
                        self.begin_auth_flow().await
                    }
                    other => {
                        warn!(error_id = other, message = %err.message, "avatar API error");
                        Ok(())
                    }
                }
            }
            other => {
                debug!(message_type = other, "unhandled avatar message");
                Ok(())
            }
        }
    }

    fn emit_status(&self, kind: StatusKind, message: String) {
        self.sink
            .notify(Event::Status(StatusUpdate::new(Surface::Avatar, kind, message)));
    }
}

#[async_trait::async_trait]
impl ControlSurface for AvatarManager {
    fn surface(&self) -> Surface {
        Surface::Avatar
    }

    async fn start(&self) {
        AvatarManager::start(self);
    }

    async fn shutdown(&self) {
        self.stop().await;
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// One full connection attempt: connect, hand the writer half to the
/// manager, run the session, clean up. Spawned by `start()`.
async fn connection_loop(manager: AvatarManager) {
    let url = manager.config.url();
    manager.state.set(ConnectionState::Connecting);
    info!(%url, "connecting to avatar tool");

    let ws = match timeout(manager.config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            warn!(error = %e, "avatar tool connect failed");
            manager.state.set(ConnectionState::Disconnected);
            manager.emit_status(StatusKind::Disconnected, "avatar tool unreachable".into());
            return;
        }
        Err(_) => {
            manager.state.set(ConnectionState::Disconnected);
            manager.emit_status(StatusKind::Disconnected, "avatar tool connect timed out".into());
            return;
        }
    };

    // Socket open. No status event yet: observers only learn about this
    // connection once authentication lands.
    manager.state.set(ConnectionState::Connected);
    let (write, read) = ws.split();
    *manager.writer.lock().await = Some(write);

    manager.run_session(read).await;

    *manager.writer.lock().await = None;
    manager.state.set(ConnectionState::Disconnected);
    manager.emit_status(StatusKind::Disconnected, "avatar tool disconnected".into());
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
