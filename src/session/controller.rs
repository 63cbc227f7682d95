//! # Conversation Session
//!
//! The single owner of all per-session state: voice gate, capture encoder, playback
//! scheduler, assessment store, monitor and transcript. The runtime feeds it events
//! one at a time; it answers with [`SessionAction`]s for the runtime to carry out.
//!
//! ## Event sources:
//! - **Audio blocks** from the microphone
//! - **Inbound messages** from the agent
//! - **Playback completions** from the mixer
//! - **Ticks** for the speaking release and the 1 Hz monitor
//! - **User commands** (mute, pause, finish, quit)
//!
//! ## Ending:
//! A session ends exactly once. Every terminal path freezes the assessment store and
//! emits one status line followed by one `Close`.

use crate::assessment::model::SessionState;
use crate::assessment::patch::parse_patch;
use crate::assessment::store::SessionStateStore;
use crate::audio::capture::{CaptureDecision, CaptureEncoder, CaptureStats};
use crate::audio::gate::VoiceGate;
use crate::audio::playback::{PlaybackScheduler, PlaybackSink, SourceId};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::protocol::{
    parse_inbound, ConversationItem, InboundMessage, OutboundMessage, SessionConfig, ASSESSMENT_TOOL,
    SIDECAR_CALL_PREFIX,
};
use crate::session::monitor::{MonitorLimits, MonitorVerdict, SessionMonitor};
use crate::session::transcript::ConversationHistory;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    ToggleMute,
    TogglePause,
    Finish,
    Quit,
}

impl UserCommand {
    /// Map one line of console input to a command.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "m" | "mute" => Some(UserCommand::ToggleMute),
            "p" | "pause" => Some(UserCommand::TogglePause),
            "f" | "finish" => Some(UserCommand::Finish),
            "q" | "quit" | "exit" => Some(UserCommand::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The agent or the user declared the assessment finished
    Completed,
    /// Hard duration cap reached
    TimedOut,
    /// User quit without finishing
    UserStopped,
    Failed(AppError),
}

impl SessionEnd {
    /// Whether the record should be handed to the report collaborator.
    pub fn should_report(&self) -> bool {
        matches!(self, SessionEnd::Completed | SessionEnd::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Send(OutboundMessage),
    Status(String),
    Close(SessionEnd),
}

pub struct ConversationSession<S: PlaybackSink> {
    id: Uuid,
    status: SessionStatus,
    gate: VoiceGate,
    capture: CaptureEncoder,
    playback: PlaybackScheduler<S>,
    store: SessionStateStore,
    monitor: SessionMonitor,
    history: ConversationHistory,
    session_config: SessionConfig,
    acknowledge_tool_calls: bool,
    barge_ins: u64,
    ended: Option<SessionEnd>,
}

impl<S: PlaybackSink> ConversationSession<S> {
    pub fn new(config: &AppConfig, sink: S, started_at: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Connecting,
            gate: VoiceGate::new(config.audio.cooldown()),
            capture: CaptureEncoder::new(&config.audio),
            playback: PlaybackScheduler::new(sink, config.audio.speaking_release()),
            store: SessionStateStore::new(started_at),
            monitor: SessionMonitor::new(MonitorLimits::from(&config.session)),
            history: ConversationHistory::new(),
            session_config: SessionConfig::from_config(config),
            acknowledge_tool_calls: config.client.acknowledge_tool_calls,
            barge_ins: 0,
            ended: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn gate(&self) -> &VoiceGate {
        &self.gate
    }

    pub fn playback(&self) -> &PlaybackScheduler<S> {
        &self.playback
    }

    pub fn state(&self) -> &SessionState {
        self.store.state()
    }

    pub fn snapshot(&self) -> SessionState {
        self.store.snapshot()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn capture_stats(&self) -> &CaptureStats {
        self.capture.stats()
    }

    pub fn barge_ins(&self) -> u64 {
        self.barge_ins
    }

    pub fn ended(&self) -> Option<&SessionEnd> {
        self.ended.as_ref()
    }

    pub fn monitor_interval(&self) -> std::time::Duration {
        self.monitor.limits().interval
    }

    /// The transport is up: configure the remote session.
    pub fn start(&mut self) -> Vec<SessionAction> {
        self.status = SessionStatus::Active;
        info!(session_id = %self.id, "Voice session started");
        vec![
            SessionAction::Send(OutboundMessage::SessionUpdate {
                session: self.session_config.clone(),
            }),
            SessionAction::Status("Connected. Start talking whenever you're ready.".to_string()),
        ]
    }

    pub fn on_audio_block(&mut self, samples: &[f32], now: Instant) -> Vec<SessionAction> {
        if self.status != SessionStatus::Active {
            return Vec::new();
        }
        match self.capture.process_block(samples, &self.gate, now).decision {
            CaptureDecision::Transmit(message) => vec![SessionAction::Send(message)],
            CaptureDecision::Drop(_) => Vec::new(),
        }
    }

    /// Handle one text frame from the transport. Undecodable frames are dropped.
    pub fn on_raw_inbound(&mut self, text: &str, now: Instant) -> Vec<SessionAction> {
        match parse_inbound(text) {
            Ok(message) => self.on_inbound(message, now),
            Err(err) => {
                warn!(error = %err, "Dropping undecodable message");
                Vec::new()
            }
        }
    }

    pub fn on_inbound(&mut self, message: InboundMessage, now: Instant) -> Vec<SessionAction> {
        if self.status == SessionStatus::Closed {
            return Vec::new();
        }

        match message {
            InboundMessage::AudioDelta { delta } => {
                if let Err(err) = self.playback.enqueue_delta(&delta, &mut self.gate) {
                    warn!(error = %err, "Dropping undecodable audio delta");
                }
                Vec::new()
            }
            InboundMessage::SpeechStarted => {
                let stopped = self.playback.barge_in(&mut self.gate);
                if stopped > 0 {
                    self.barge_ins += 1;
                }
                vec![SessionAction::Send(OutboundMessage::AudioClear)]
            }
            InboundMessage::FunctionCallDone { name, arguments, call_id } => {
                self.on_function_call(&name, &arguments, call_id, now)
            }
            InboundMessage::Error { .. } => {
                let text = message.error_text().unwrap_or_default();
                error!(error = %text, "Agent reported an error");
                self.fail(AppError::Transport(text))
            }
            message @ (InboundMessage::UserTranscript { .. } | InboundMessage::AgentTranscript { .. }) => {
                self.history.observe(&message);
                Vec::new()
            }
            InboundMessage::Other => Vec::new(),
        }
    }

    fn on_function_call(
        &mut self,
        name: &str,
        arguments: &str,
        call_id: String,
        now: Instant,
    ) -> Vec<SessionAction> {
        if !name.is_empty() && name != ASSESSMENT_TOOL {
            warn!(tool = %name, "Ignoring call to unknown tool");
            return Vec::new();
        }

        let patch = match parse_patch(arguments) {
            Ok(patch) => patch,
            Err(err) => {
                warn!(error = %err, "Dropping malformed assessment patch");
                return Vec::new();
            }
        };

        let outcome = match self.store.apply_patch(patch, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(error = %err, "Patch not applied");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        // Sidecar calls were injected by the relay; the agent never issued them
        if self.acknowledge_tool_calls && !call_id.is_empty() && !call_id.starts_with(SIDECAR_CALL_PREFIX) {
            actions.push(SessionAction::Send(OutboundMessage::ItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id,
                    output: json!({ "success": true }).to_string(),
                },
            }));
            actions.push(SessionAction::Send(OutboundMessage::ResponseCreate));
        }

        if outcome.completed {
            actions.extend(self.finish(
                SessionEnd::Completed,
                "Assessment complete. Thanks for the conversation!".to_string(),
            ));
        }
        actions
    }

    pub fn on_playback_ended(&mut self, id: SourceId, now: Instant) {
        self.playback.on_source_ended(id, now);
    }

    /// Fast tick: finish a pending speaking release.
    pub fn on_release_tick(&mut self, now: Instant) {
        self.playback.poll_release(now, &mut self.gate);
    }

    /// Slow tick: duration limits and early-exit eligibility.
    pub fn on_monitor_tick(&mut self, now: Instant) -> Vec<SessionAction> {
        if self.status != SessionStatus::Active {
            return Vec::new();
        }
        let elapsed = now.saturating_duration_since(self.store.started_at());
        match self.monitor.check(elapsed, self.store.state()) {
            MonitorVerdict::Running => Vec::new(),
            MonitorVerdict::EarlyExitEligible => vec![SessionAction::Status(
                "All dimensions are well covered. Type 'f' to finish now, or keep talking.".to_string(),
            )],
            MonitorVerdict::HardTimeout => self.fail(AppError::Timeout(format!("{}s limit", elapsed.as_secs()))),
        }
    }

    pub fn on_command(&mut self, command: UserCommand) -> Vec<SessionAction> {
        if self.status == SessionStatus::Closed {
            return Vec::new();
        }
        match command {
            UserCommand::ToggleMute => {
                let muted = self.gate.toggle_mute();
                vec![SessionAction::Status(
                    if muted { "Microphone muted." } else { "Microphone live." }.to_string(),
                )]
            }
            UserCommand::TogglePause => {
                let paused = self.gate.toggle_pause();
                vec![SessionAction::Status(
                    if paused { "Session paused." } else { "Session resumed." }.to_string(),
                )]
            }
            UserCommand::Finish => self.finish(SessionEnd::Completed, "Finishing the session.".to_string()),
            UserCommand::Quit => self.finish(SessionEnd::UserStopped, "Session stopped.".to_string()),
        }
    }

    /// The transport failed or closed underneath the session.
    pub fn on_transport_error(&mut self, err: AppError) -> Vec<SessionAction> {
        self.fail(err)
    }

    fn fail(&mut self, err: AppError) -> Vec<SessionAction> {
        if !err.is_fatal() {
            warn!(error = %err, "Recoverable error, session continues");
            return Vec::new();
        }
        let message = err.status_message();
        if err.is_failure() {
            self.finish(SessionEnd::Failed(err), message)
        } else {
            self.finish(SessionEnd::TimedOut, message)
        }
    }

    fn finish(&mut self, end: SessionEnd, message: String) -> Vec<SessionAction> {
        if self.status == SessionStatus::Closed {
            return Vec::new();
        }
        self.playback.barge_in(&mut self.gate);
        self.store.freeze();
        self.status = SessionStatus::Closed;
        self.ended = Some(end.clone());

        let stats = self.capture_stats();
        info!(
            session_id = %self.id,
            end = ?end,
            evidence = self.store.state().evidence_log.len(),
            blocks_sent = stats.transmitted,
            blocks_seen = stats.blocks_seen,
            barge_ins = self.barge_ins(),
            "Voice session ended"
        );

        vec![SessionAction::Status(message), SessionAction::Close(end)]
    }
}
