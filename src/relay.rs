//! # WebSocket Relay
//!
//! Sits between a voice client and the realtime agent so the agent's API key never
//! leaves the server. Clients connect to `/ws/relay`; each connection gets its own
//! upstream socket.
//!
//! ## Connection Lifecycle:
//! 1. **Accept**: the actor starts and registers the session
//! 2. **Authenticate**: no API key configured → close with a policy violation
//! 3. **Upstream**: a background task opens the agent socket with bearer auth
//! 4. **Forward**: client text frames go up (session updates rewritten on the way),
//!    agent frames come back down unchanged
//! 5. **Failure**: upstream errors become one `error` frame, then the client is closed
//!
//! With the sidecar enabled, every user transcript also triggers an analysis whose
//! result reaches the client as an injected `updateAssessmentState` call.
//!
//! ## Message Flow:
//! - **Client → Relay**: JSON text frames (`session.update`, `input_audio_buffer.append`, ...)
//! - **Relay → Agent**: the same frames, through an mpsc channel to the upstream task
//! - **Agent → Relay → Client**: actor messages carrying the raw text

use crate::config::{AppConfig, UpstreamConfig};
use crate::error::{AppError, AppResult};
use crate::protocol::{parse_inbound, InboundMessage};
use crate::session::transcript::ConversationHistory;
use crate::sidecar::SidecarClient;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Adjusts client `session.update` messages before they reach the agent.
#[derive(Debug, Clone)]
pub struct SessionUpdateRewriter {
    transcription_model: String,
    force_transcription: bool,
    strip_tools: bool,
}

impl SessionUpdateRewriter {
    pub fn from_config(upstream: &UpstreamConfig) -> Self {
        Self {
            transcription_model: upstream.transcription_model.clone(),
            force_transcription: upstream.force_input_transcription,
            strip_tools: upstream.strip_tools,
        }
    }

    /// Returns the frame to forward. Anything that is not a parseable
    /// `session.update` goes through untouched.
    pub fn rewrite(&self, text: &str) -> String {
        let Ok(mut message) = serde_json::from_str::<Value>(text) else {
            return text.to_string();
        };
        if message.get("type").and_then(Value::as_str) != Some("session.update") {
            return text.to_string();
        }
        let Some(session) = message.get_mut("session").and_then(Value::as_object_mut) else {
            return text.to_string();
        };

        let mut changed = false;
        if self.force_transcription && !session.contains_key("input_audio_transcription") {
            session.insert(
                "input_audio_transcription".to_string(),
                json!({ "model": self.transcription_model }),
            );
            changed = true;
        }
        if self.strip_tools && session.remove("tools").is_some() {
            info!("Stripping tools from session update");
            session.insert("tool_choice".to_string(), json!("none"));
            changed = true;
        }

        if changed {
            message.to_string()
        } else {
            text.to_string()
        }
    }
}

/// Text frame received from the agent.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamText(String);

/// The upstream socket is open.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamConnected;

/// The upstream socket could not be opened or broke.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamFailed(String);

/// The agent closed the upstream socket.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamClosed(String);

/// One client connection and its upstream counterpart.
pub struct RelaySocket {
    id: String,
    state: web::Data<AppState>,
    config: AppConfig,
    rewriter: SessionUpdateRewriter,
    upstream_tx: Option<mpsc::UnboundedSender<String>>,
    history: ConversationHistory,
    sidecar: Option<SidecarClient>,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let config = state.get_config();
        let sidecar = SidecarClient::from_config(&config.sidecar).unwrap_or_else(|err| {
            error!(error = %err, "Sidecar unavailable for this connection");
            None
        });
        Self {
            id: Uuid::new_v4().to_string(),
            sidecar,
            rewriter: SessionUpdateRewriter::from_config(&config.upstream),
            state,
            config,
            upstream_tx: None,
            history: ConversationHistory::new(),
            last_heartbeat: Instant::now(),
        }
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.config.upstream.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Send one error frame in the agent's own format.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        let frame = json!({
            "type": "error",
            "error": { "message": message }
        });
        ctx.text(frame.to_string());
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.id, "Relay client heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn start_upstream(&mut self, api_key: String, ctx: &mut ws::WebsocketContext<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.upstream_tx = Some(tx);

        let url = self.config.upstream.url.clone();
        let addr = ctx.address();
        let session_id = self.id.clone();

        tokio::spawn(async move {
            if let Err(err) = run_upstream(&url, &api_key, rx, addr.clone()).await {
                error!(session_id = %session_id, error = %err, "Upstream connection failed");
                addr.do_send(UpstreamFailed(err.to_string()));
            }
        });
    }

    fn track_transcripts(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Ok(message) = parse_inbound(text) else {
            return;
        };
        if !self.history.observe(&message) {
            return;
        }
        let (user_turns, agent_turns) = (self.history.user_turns(), self.history.agent_turns());
        self.state.update_session(&self.id, |s| {
            s.user_turns = user_turns;
            s.agent_turns = agent_turns;
        });
        if matches!(message, InboundMessage::UserTranscript { .. }) {
            self.request_analysis(ctx);
        }
    }

    /// Analyze the history so far in the background; the result comes back as agent text.
    fn request_analysis(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(sidecar) = self.sidecar.clone() else {
            return;
        };
        let history = self.history.turns().to_vec();
        let addr = ctx.address();
        let state = self.state.clone();
        let session_id = self.id.clone();

        tokio::spawn(async move {
            match sidecar.analyze(history).await {
                Ok(frame) => {
                    state.record_sidecar_update();
                    addr.do_send(UpstreamText(frame));
                }
                Err(err) => warn!(session_id = %session_id, error = %err, "Sidecar analysis failed"),
            }
        });
    }
}

/// Connect to the agent and pump frames until either side stops.
async fn run_upstream(
    url: &str,
    api_key: &str,
    mut rx: mpsc::UnboundedReceiver<String>,
    addr: Addr<RelaySocket>,
) -> AppResult<()> {
    let mut request = url.into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|e| AppError::ConfigError(format!("invalid API key header: {}", e)))?;
    request.headers_mut().insert("Authorization", bearer);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    info!("Connected to realtime agent");
    addr.do_send(UpstreamConnected);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(text) => sink.send(UpstreamMessage::Text(text)).await?,
                None => {
                    // Client went away
                    let _ = sink.send(UpstreamMessage::Close(None)).await;
                    return Ok(());
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(UpstreamMessage::Text(text))) => addr.do_send(UpstreamText(text)),
                Some(Ok(UpstreamMessage::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    addr.do_send(UpstreamClosed(reason));
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => {
                    addr.do_send(UpstreamClosed(String::new()));
                    return Ok(());
                }
            },
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.id, "Relay connection started");
        self.state.register_session(&self.id);
        self.start_heartbeat(ctx);

        match self.api_key() {
            Some(key) => self.start_upstream(key, ctx),
            None => {
                error!(
                    env = %self.config.upstream.api_key_env,
                    "Upstream API key is missing, refusing relay connection"
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("Missing API Key".to_string()),
                }));
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender ends the upstream task
        self.upstream_tx.take();
        self.state.remove_session(&self.id);
        info!(
            session_id = %self.id,
            user_turns = self.history.user_turns(),
            agent_turns = self.history.agent_turns(),
            "Relay connection stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let frame = self.rewriter.rewrite(&text);
                let forwarded = self
                    .upstream_tx
                    .as_ref()
                    .is_some_and(|tx| tx.send(frame).is_ok());
                if forwarded {
                    self.state.record_frame_to_upstream();
                } else {
                    debug!(session_id = %self.id, "Upstream not available, dropping client frame");
                }
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(bytes = data.len(), "Ignoring binary frame; audio must be sent as JSON text");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.id, ?reason, "Relay client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamText> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamText, ctx: &mut Self::Context) {
        self.track_transcripts(&msg.0, ctx);
        self.state.record_frame_to_client();
        ctx.text(msg.0);
    }
}

impl Handler<UpstreamConnected> for RelaySocket {
    type Result = ();

    fn handle(&mut self, _msg: UpstreamConnected, _ctx: &mut Self::Context) {
        self.state.update_session(&self.id, |s| s.upstream_connected = true);
    }
}

impl Handler<UpstreamFailed> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamFailed, ctx: &mut Self::Context) {
        self.state.record_upstream_error();
        self.send_error(ctx, &msg.0);
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some("Upstream connection failed".to_string()),
        }));
        ctx.stop();
    }
}

impl Handler<UpstreamClosed> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamClosed, ctx: &mut Self::Context) {
        info!(session_id = %self.id, reason = %msg.0, "Agent closed the upstream connection");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler for `/ws/relay`.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New relay connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(RelaySocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter(strip_tools: bool) -> SessionUpdateRewriter {
        let mut upstream = AppConfig::default().upstream;
        upstream.strip_tools = strip_tools;
        SessionUpdateRewriter::from_config(&upstream)
    }

    #[test]
    fn test_transcription_is_forced_on() {
        let out = rewriter(false).rewrite(r#"{"type":"session.update","session":{"voice":"alloy"}}"#);
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(value["session"]["voice"], "alloy");
    }

    #[test]
    fn test_existing_transcription_is_kept() {
        let input = r#"{"type":"session.update","session":{"input_audio_transcription":{"model":"custom"}}}"#;
        assert_eq!(rewriter(false).rewrite(input), input);
    }

    #[test]
    fn test_tools_stripped_when_enabled() {
        let input = r#"{"type":"session.update","session":{"tools":[{"name":"x"}],"tool_choice":"auto","input_audio_transcription":{"model":"whisper-1"}}}"#;
        let value: Value = serde_json::from_str(&rewriter(true).rewrite(input)).unwrap();
        assert!(value["session"].get("tools").is_none());
        assert_eq!(value["session"]["tool_choice"], "none");

        // Off by default
        let kept: Value = serde_json::from_str(&rewriter(false).rewrite(input)).unwrap();
        assert_eq!(kept["session"]["tools"][0]["name"], "x");
    }

    #[test]
    fn test_other_frames_pass_through() {
        let append = r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#;
        assert_eq!(rewriter(true).rewrite(append), append);
        assert_eq!(rewriter(true).rewrite("not json"), "not json");
    }
}
