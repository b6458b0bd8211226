//! Compositor connection manager
//!
//! Request/response only: the compositing tool has no push channel, and
//! its credential check is a single probe round trip at connect time.
//! Reconnection is strictly manual: a failed command never reconnects on
//! the command path, so command bursts against a dead target stay cheap.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::events::{Event, SharedSink, StatusKind, StatusUpdate, Surface};
use crate::protocol::{Request, Response};
use crate::surface::{ConnectionConfig, ConnectionState, ControlSurface, StateCell};
use crate::types::{Result, StagehandError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Input kinds counted as audio sources in a state snapshot.
const AUDIO_KIND_MARKERS: &[&str] = &["capture", "audio", "input"];

/// The closed set of commands the compositor accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositorCommand {
    SwitchScene { scene: String },
    SetInputMute { input: String, muted: bool },
    ToggleStream,
    ToggleRecord,
    /// `visible: None` toggles: read the current state, write the
    /// negation. Two round trips, last-write-wins against concurrent
    /// external changes.
    SetItemVisibility {
        scene: String,
        source: String,
        visible: Option<bool>,
    },
}

/// What a successfully executed command reports back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    SceneChanged { scene: String },
    MuteSet { input: String, muted: bool },
    StreamToggled { active: bool },
    RecordToggled { active: bool },
    ItemVisibility { source: String, visible: bool },
}

/// A source placed inside a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: String,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub name: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInput {
    pub name: String,
}

/// Composite read of the compositor's scene/source/input layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub scenes: Vec<SceneSnapshot>,
    #[serde(rename = "audioInputs")]
    pub audio_inputs: Vec<AudioInput>,
}

// Wire payloads, keyed by messageType.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneNameOnly {
    scene_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneListPayload {
    #[serde(default)]
    scenes: Vec<SceneNameOnly>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItem {
    source_name: String,
    scene_item_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemListPayload {
    #[serde(default)]
    scene_items: Vec<SceneItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputInfo {
    input_name: String,
    #[serde(default)]
    input_kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputListPayload {
    #[serde(default)]
    inputs: Vec<InputInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemIdPayload {
    scene_item_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemEnabledPayload {
    scene_item_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputActivePayload {
    #[serde(default)]
    output_active: bool,
}

/// Compositor connection manager. One instance per process, injected
/// wherever compositor commands originate.
pub struct CompositorManager {
    config: ConnectionConfig,
    state: StateCell,
    io: Mutex<Option<WsStream>>,
    sink: SharedSink,
}

impl CompositorManager {
    pub fn new(config: ConnectionConfig, sink: SharedSink) -> Self {
        Self {
            config,
            state: StateCell::new(Surface::Compositor),
            io: Mutex::new(None),
            sink,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Attempt exactly one connection plus capability probe. Returns
    /// whether the compositor is usable afterwards. Never retries; a
    /// `false` here stays `false` until the caller asks again.
    pub async fn connect(&self) -> bool {
        let mut io = self.io.lock().await;

        // Re-probe a live socket before opening a fresh one.
        if let Some(ws) = io.as_mut() {
            if self.probe(ws).await.is_ok() {
                return true;
            }
            *io = None;
            self.state.set(ConnectionState::Disconnected);
        }

        self.state.set(ConnectionState::Connecting);
        match self.open_and_probe().await {
            Ok((ws, version)) => {
                *io = Some(ws);
                self.state.set(ConnectionState::Connected);
                info!(version = %version, "compositor connected");
                self.emit_status(StatusKind::Connected, format!("compositor connected (v{version})"));
                true
            }
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                warn!(error = %e, "compositor connect failed");
                self.emit_status(StatusKind::Disconnected, format!("compositor unreachable: {e}"));
                false
            }
        }
    }

    /// Execute one command. `Ok(None)` when not connected: callers stay
    /// responsive regardless of connection state, and the command path
    /// never reconnects. A transport failure mid-command downgrades the
    /// connection and surfaces the error to this caller only.
    pub async fn execute(&self, command: CompositorCommand) -> Result<Option<CommandOutcome>> {
        // Fast path: while disconnected this must cost no more than a
        // state read, even if a connect attempt holds the I/O lock.
        if !self.state.get().is_connected() {
            return Ok(None);
        }
        let mut io = self.io.lock().await;
        if !self.state.get().is_connected() {
            return Ok(None);
        }
        let Some(ws) = io.as_mut() else {
            return Ok(None);
        };

        match self.dispatch(ws, &command).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_transport() => {
                *io = None;
                self.state.set(ConnectionState::Disconnected);
                warn!(error = %e, "compositor connection lost");
                self.emit_status(StatusKind::Disconnected, format!("compositor connection lost: {e}"));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Composite read of scenes, per-scene items, and audio inputs. The
    /// three sub-queries run sequentially; if any fails the whole read
    /// fails and the connection is marked disconnected. No partials.
    pub async fn snapshot_state(&self) -> Result<Option<StateSnapshot>> {
        if !self.state.get().is_connected() {
            return Ok(None);
        }
        let mut io = self.io.lock().await;
        if !self.state.get().is_connected() {
            return Ok(None);
        }
        let Some(ws) = io.as_mut() else {
            return Ok(None);
        };

        match self.collect_snapshot(ws).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                *io = None;
                self.state.set(ConnectionState::Disconnected);
                warn!(error = %e, "compositor snapshot failed");
                self.emit_status(StatusKind::Disconnected, format!("compositor connection lost: {e}"));
                Err(e)
            }
        }
    }

    async fn open_and_probe(&self) -> Result<(WsStream, String)> {
        let url = self.config.url();
        let (mut ws, _) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| StagehandError::Timeout(format!("connect to {url}")))?
            .map_err(|e| StagehandError::WebSocket(e.to_string()))?;

        match self.probe(&mut ws).await {
            Ok(version) => Ok((ws, version)),
            Err(e) => {
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    /// One version-query round trip carrying the optional password: the
    /// compositor's one-shot credential check.
    async fn probe(&self, ws: &mut WsStream) -> Result<String> {
        let data = self
            .config
            .password
            .as_ref()
            .map(|password| json!({ "password": password }));
        let payload = self
            .round_trip(ws, "GetVersionRequest", data, "GetVersionResponse")
            .await?;
        let info: VersionInfo = serde_json::from_value(payload)?;
        Ok(info.version)
    }

    async fn dispatch(&self, ws: &mut WsStream, command: &CompositorCommand) -> Result<CommandOutcome> {
        match command {
            CompositorCommand::SwitchScene { scene } => {
                let payload = self
                    .round_trip(
                        ws,
                        "SetCurrentSceneRequest",
                        Some(json!({ "sceneName": scene })),
                        "SetCurrentSceneResponse",
                    )
                    .await?;
                let applied = serde_json::from_value::<SceneNameOnly>(payload)
                    .map(|p| p.scene_name)
                    .unwrap_or_else(|_| scene.clone());
                Ok(CommandOutcome::SceneChanged { scene: applied })
            }
            CompositorCommand::SetInputMute { input, muted } => {
                self.round_trip(
                    ws,
                    "SetInputMuteRequest",
                    Some(json!({ "inputName": input, "inputMuted": muted })),
                    "SetInputMuteResponse",
                )
                .await?;
                Ok(CommandOutcome::MuteSet {
                    input: input.clone(),
                    muted: *muted,
                })
            }
            CompositorCommand::ToggleStream => {
                let payload = self
                    .round_trip(ws, "ToggleStreamRequest", None, "ToggleStreamResponse")
                    .await?;
                let out: OutputActivePayload = serde_json::from_value(payload)?;
                Ok(CommandOutcome::StreamToggled { active: out.output_active })
            }
            CompositorCommand::ToggleRecord => {
                let payload = self
                    .round_trip(ws, "ToggleRecordRequest", None, "ToggleRecordResponse")
                    .await?;
                let out: OutputActivePayload = serde_json::from_value(payload)?;
                Ok(CommandOutcome::RecordToggled { active: out.output_active })
            }
            CompositorCommand::SetItemVisibility { scene, source, visible } => {
                let payload = self
                    .round_trip(
                        ws,
                        "GetSceneItemIdRequest",
                        Some(json!({ "sceneName": scene, "sourceName": source })),
                        "GetSceneItemIdResponse",
                    )
                    .await?;
                let item: SceneItemIdPayload = serde_json::from_value(payload)?;

                let target = match visible {
                    Some(explicit) => *explicit,
                    None => {
                        let payload = self
                            .round_trip(
                                ws,
                                "GetSceneItemEnabledRequest",
                                Some(json!({ "sceneName": scene, "sceneItemId": item.scene_item_id })),
                                "GetSceneItemEnabledResponse",
                            )
                            .await?;
                        let current: SceneItemEnabledPayload = serde_json::from_value(payload)?;
                        !current.scene_item_enabled
                    }
                };

                self.round_trip(
                    ws,
                    "SetSceneItemEnabledRequest",
                    Some(json!({
                        "sceneName": scene,
                        "sceneItemId": item.scene_item_id,
                        "sceneItemEnabled": target,
                    })),
                    "SetSceneItemEnabledResponse",
                )
                .await?;
                Ok(CommandOutcome::ItemVisibility {
                    source: source.clone(),
                    visible: target,
                })
            }
        }
    }

    async fn collect_snapshot(&self, ws: &mut WsStream) -> Result<StateSnapshot> {
        let payload = self
            .round_trip(ws, "GetSceneListRequest", None, "GetSceneListResponse")
            .await?;
        let scene_list: SceneListPayload = serde_json::from_value(payload)?;

        let mut scenes = Vec::with_capacity(scene_list.scenes.len());
        for scene in &scene_list.scenes {
            let payload = self
                .round_trip(
                    ws,
                    "GetSceneItemListRequest",
                    Some(json!({ "sceneName": scene.scene_name })),
                    "GetSceneItemListResponse",
                )
                .await?;
            let items: SceneItemListPayload = serde_json::from_value(payload)?;
            scenes.push(SceneSnapshot {
                name: scene.scene_name.clone(),
                sources: items
                    .scene_items
                    .into_iter()
                    .map(|item| SourceRef {
                        name: item.source_name,
                        id: item.scene_item_id,
                    })
                    .collect(),
            });
        }

        let payload = self
            .round_trip(ws, "GetInputListRequest", None, "GetInputListResponse")
            .await?;
        let inputs: InputListPayload = serde_json::from_value(payload)?;
        let audio_inputs = inputs
            .inputs
            .into_iter()
            .filter(|input| {
                AUDIO_KIND_MARKERS
                    .iter()
                    .any(|marker| input.input_kind.contains(marker))
            })
            .map(|input| AudioInput { name: input.input_name })
            .collect();

        Ok(StateSnapshot { scenes, audio_inputs })
    }

    /// Send one request and wait for its reply, bounded by the request
    /// timeout. Replies are correlated by the echoed request ID; frames
    /// for other requests are discarded (this protocol has no pushes).
    async fn round_trip(
        &self,
        ws: &mut WsStream,
        message_type: &str,
        data: Option<Value>,
        expected: &str,
    ) -> Result<Value> {
        let request = Request::new(message_type, data);
        ws.send(Message::Text(request.encode()?)).await?;

        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StagehandError::Timeout(format!("{message_type} reply")));
            }
            let frame = match timeout(remaining, ws.next()).await {
                Err(_) => return Err(StagehandError::Timeout(format!("{message_type} reply"))),
                Ok(None) => return Err(StagehandError::WebSocket("connection closed".into())),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };

            let raw = match frame {
                Message::Text(raw) => raw,
                Message::Close(_) => {
                    return Err(StagehandError::WebSocket("connection closed".into()))
                }
                _ => continue,
            };

            let response = Response::decode(&raw)?;
            match &response.request_id {
                Some(id) if *id != request.request_id => continue,
                _ => {}
            }

            if let Some(err) = response.api_error() {
                return Err(StagehandError::Protocol(format!(
                    "{} (error {})",
                    err.message, err.error_id
                )));
            }
            if response.message_type != expected {
                return Err(StagehandError::Protocol(format!(
                    "expected {expected}, got {}",
                    response.message_type
                )));
            }
            return Ok(response.data);
        }
    }

    fn emit_status(&self, kind: StatusKind, message: String) {
        self.sink
            .notify(Event::Status(StatusUpdate::new(Surface::Compositor, kind, message)));
    }
}

#[async_trait::async_trait]
impl ControlSurface for CompositorManager {
    fn surface(&self) -> Surface {
        Surface::Compositor
    }

    async fn start(&self) {
        let _ = self.connect().await;
    }

    async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        if let Some(mut ws) = io.take() {
            let _ = ws.close(None).await;
        }
        if self.state.get() != ConnectionState::Disconnected {
            self.state.set(ConnectionState::Disconnected);
            self.emit_status(StatusKind::Disconnected, "compositor shut down".into());
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingSink;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn bind() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn manager_for(addr: SocketAddr) -> (CompositorManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = ConnectionConfig::new("127.0.0.1", addr.port())
            .with_connect_timeout(Duration::from_millis(500))
            .with_request_timeout(Duration::from_millis(500));
        (CompositorManager::new(config, sink.clone()), sink)
    }

    /// Serve one client, answering each request via `script`. A `None`
    /// from the script closes the connection.
    fn spawn_scripted<F>(listener: TcpListener, script: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&str, &Value) -> Option<(&'static str, Value)> + Send + 'static,
    {
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(raw) = message else { continue };
                let request: Value = serde_json::from_str(&raw).unwrap();
                let message_type = request["messageType"].as_str().unwrap_or_default();
                let Some((reply_type, data)) = script(message_type, &request["data"]) else {
                    let _ = ws.close(None).await;
                    return;
                };
                let reply = json!({
                    "messageType": reply_type,
                    "requestID": request["requestID"],
                    "data": data,
                });
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
        })
    }

    fn standard_script(message_type: &str, data: &Value) -> Option<(&'static str, Value)> {
        Some(match message_type {
            "GetVersionRequest" => ("GetVersionResponse", json!({"version": "30.1"})),
            "SetCurrentSceneRequest" => (
                "SetCurrentSceneResponse",
                json!({"sceneName": data["sceneName"]}),
            ),
            "SetInputMuteRequest" => ("SetInputMuteResponse", json!({})),
            "ToggleStreamRequest" => ("ToggleStreamResponse", json!({"outputActive": true})),
            "ToggleRecordRequest" => ("ToggleRecordResponse", json!({"outputActive": false})),
            "GetSceneItemIdRequest" => ("GetSceneItemIdResponse", json!({"sceneItemId": 7})),
            "GetSceneItemEnabledRequest" => (
                "GetSceneItemEnabledResponse",
                json!({"sceneItemEnabled": true}),
            ),
            "SetSceneItemEnabledRequest" => ("SetSceneItemEnabledResponse", json!({})),
            "GetSceneListRequest" => (
                "GetSceneListResponse",
                json!({"scenes": [{"sceneName": "Main"}, {"sceneName": "BRB"}]}),
            ),
            "GetSceneItemListRequest" => (
                "GetSceneItemListResponse",
                json!({"sceneItems": [{"sourceName": "cam", "sceneItemId": 1}]}),
            ),
            "GetInputListRequest" => (
                "GetInputListResponse",
                json!({"inputs": [
                    {"inputName": "Mic", "inputKind": "audio_input_capture"},
                    {"inputName": "Browser", "inputKind": "browser_source"},
                ]}),
            ),
            _ => return None,
        })
    }

    #[tokio::test]
    async fn test_execute_while_disconnected_returns_absent() {
        let (_listener, addr) = bind().await;
        let (manager, sink) = manager_for(addr);

        let result = manager
            .execute(CompositorCommand::SwitchScene { scene: "Live".into() })
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(manager.snapshot_state().await.unwrap().is_none());
        assert!(sink.events().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_unreachable_emits_single_disconnect() {
        let (listener, addr) = bind().await;
        drop(listener);
        let (manager, sink) = manager_for(addr);

        assert!(!manager.connect().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(sink.statuses(), vec![(StatusKind::Disconnected, false)]);
    }

    #[tokio::test]
    async fn test_connect_and_switch_scene() {
        let (listener, addr) = bind().await;
        let server = spawn_scripted(listener, standard_script);
        let (manager, sink) = manager_for(addr);

        assert!(manager.connect().await);
        assert!(manager.is_connected());

        // A second connect re-probes the live socket without a fresh
        // attempt or a duplicate event.
        assert!(manager.connect().await);
        assert_eq!(sink.statuses(), vec![(StatusKind::Connected, true)]);

        let outcome = manager
            .execute(CompositorCommand::SwitchScene { scene: "Live".into() })
            .await
            .unwrap();
        assert_eq!(outcome, Some(CommandOutcome::SceneChanged { scene: "Live".into() }));

        manager.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_rejected_credential() {
        let (listener, addr) = bind().await;
        let server = spawn_scripted(listener, |message_type, _| match message_type {
            "GetVersionRequest" => Some((
                "APIError",
                json!({"errorID": 8, "message": "authentication failed"}),
            )),
            _ => None,
        });
        let (manager, sink) = manager_for(addr);

        assert!(!manager.connect().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(sink.statuses(), vec![(StatusKind::Disconnected, false)]);
        server.abort();
    }

    #[tokio::test]
    async fn test_visibility_toggle_negates_current_state() {
        let (listener, addr) = bind().await;
        let server = spawn_scripted(listener, standard_script);
        let (manager, _sink) = manager_for(addr);

        assert!(manager.connect().await);
        // Server reports the item as enabled; toggling must disable it.
        let outcome = manager
            .execute(CompositorCommand::SetItemVisibility {
                scene: "Main".into(),
                source: "cam".into(),
                visible: None,
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Some(CommandOutcome::ItemVisibility { source: "cam".into(), visible: false })
        );

        manager.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_transport_failure_marks_disconnected() {
        let (listener, addr) = bind().await;
        let server = spawn_scripted(listener, |message_type, data| match message_type {
            "ToggleStreamRequest" => None, // close mid-session
            other => standard_script(other, data),
        });
        let (manager, sink) = manager_for(addr);

        assert!(manager.connect().await);
        let result = manager.execute(CompositorCommand::ToggleStream).await;
        assert!(result.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            sink.statuses(),
            vec![(StatusKind::Connected, true), (StatusKind::Disconnected, false)]
        );

        // Subsequent commands are absent, with no further events.
        let after = manager.execute(CompositorCommand::ToggleStream).await.unwrap();
        assert!(after.is_none());
        assert_eq!(sink.statuses().len(), 2);
        server.abort();
    }

    #[tokio::test]
    async fn test_snapshot_collects_all_three_queries() {
        let (listener, addr) = bind().await;
        let server = spawn_scripted(listener, standard_script);
        let (manager, _sink) = manager_for(addr);

        assert!(manager.connect().await);
        let snapshot = manager.snapshot_state().await.unwrap().unwrap();

        assert_eq!(snapshot.scenes.len(), 2);
        assert_eq!(snapshot.scenes[0].name, "Main");
        assert_eq!(
            snapshot.scenes[0].sources,
            vec![SourceRef { name: "cam".into(), id: 1 }]
        );
        // Only kinds matching the audio markers survive the filter.
        assert_eq!(snapshot.audio_inputs, vec![AudioInput { name: "Mic".into() }]);

        manager.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_snapshot_fails_atomically_mid_sequence() {
        let (listener, addr) = bind().await;
        let server = spawn_scripted(listener, |message_type, data| match message_type {
            "GetSceneItemListRequest" => None, // die after the scene list
            other => standard_script(other, data),
        });
        let (manager, sink) = manager_for(addr);

        assert!(manager.connect().await);
        assert!(manager.snapshot_state().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            sink.statuses(),
            vec![(StatusKind::Connected, true), (StatusKind::Disconnected, false)]
        );
        server.abort();
    }
}
