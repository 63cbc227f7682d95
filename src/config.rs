//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_AUDIO__BLOCK_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the relay listens
//! - **upstream**: the remote realtime agent the relay connects to
//! - **client**: what the voice client connects to and how it introduces itself
//! - **audio**: capture block size, gating windows, echo heuristics
//! - **session**: duration limits watched by the session monitor
//! - **turn_detection**: server-side VAD parameters sent in `session.update`
//! - **sidecar**: optional relay-side analysis model that produces assessment updates

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub client: ClientConfig,
    pub audio: AudioSettings,
    pub session: SessionLimits,
    pub turn_detection: TurnDetectionConfig,
    pub sidecar: SidecarConfig,
}

/// Relay server bind address.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The realtime agent the relay forwards to.
///
/// The API key itself never lives in the config file: `api_key_env` names the
/// environment variable it is read from at connection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key_env: String,
    /// Model used for server-side transcription of the user's audio
    pub transcription_model: String,
    /// Add `input_audio_transcription` to session updates that lack it
    pub force_input_transcription: bool,
    /// Remove tools from session updates (when assessments are produced elsewhere)
    pub strip_tools: bool,
}

/// Voice client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Websocket endpoint, usually the relay's `/ws/relay`
    pub endpoint: String,
    pub voice: String,
    pub instructions: String,
    /// Answer every structured update with a function_call_output and response.create
    pub acknowledge_tool_calls: bool,
    /// Where the finished session snapshot is posted, if anywhere
    #[serde(default)]
    pub report_endpoint: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// How the capture pipeline reacts to a suspected echo block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicy {
    /// Record the echo score for diagnostics only
    LogOnly,
    /// Drop blocks classified as echo
    Block,
}

/// Audio pipeline tuning. Capture always runs at the 24 kHz wire rate.
///
/// ## Tuning guidelines:
/// - `block_size` 4096 at 24 kHz is ~170 ms per outbound frame
/// - `cooldown_ms` absorbs the acoustic tail after the agent stops talking
/// - `speaking_release_ms` keeps back-to-back fragments from flapping the speaking flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub block_size: usize,
    pub fft_size: usize,
    pub cooldown_ms: u64,
    pub speaking_release_ms: u64,
    pub echo_threshold: f32,
    pub echo_policy: EchoPolicy,
    pub calibration_enabled: bool,
    pub calibration_samples: usize,
    /// Standard deviations subtracted from the mean echo ratio
    pub calibration_sigma: f32,
    /// Lowest threshold calibration may produce
    pub calibration_floor: f32,
}

/// Session duration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    pub max_duration_secs: u64,
    pub early_exit_after_secs: u64,
    pub monitor_interval_ms: u64,
}

/// Relay-side analysis of the transcript by a chat-completions model.
///
/// When enabled, every user transcript sends the conversation so far to `url`
/// and the answer is delivered to the client as an `updateAssessmentState`
/// call. Usually paired with `upstream.strip_tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

/// Server VAD parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

pub const DEFAULT_INSTRUCTIONS: &str = "You are a warm, curious cultural intelligence coach. \
Hold a natural spoken conversation that explores how the user communicates across cultures: \
directness and transparency, task versus relationship focus, conflict orientation, \
cultural adaptability, and empathy. Ask one question at a time. After every user turn, \
call updateAssessmentState with your current view of the five dimensions.";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime?model=gpt-4o-mini-realtime-preview-2024-12-17"
                    .to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                transcription_model: "whisper-1".to_string(),
                force_input_transcription: true,
                strip_tools: false,
            },
            client: ClientConfig {
                endpoint: "ws://127.0.0.1:8080/ws/relay".to_string(),
                voice: "alloy".to_string(),
                instructions: DEFAULT_INSTRUCTIONS.to_string(),
                acknowledge_tool_calls: true,
                report_endpoint: None,
                email: None,
            },
            audio: AudioSettings {
                block_size: 4096,
                fft_size: 2048,
                cooldown_ms: 500,
                speaking_release_ms: 200,
                echo_threshold: 1.5,
                echo_policy: EchoPolicy::LogOnly,
                calibration_enabled: false,
                calibration_samples: 40,
                calibration_sigma: 1.0,
                calibration_floor: 1.0,
            },
            session: SessionLimits {
                max_duration_secs: 20 * 60,
                early_exit_after_secs: 5 * 60,
                monitor_interval_ms: 1000,
            },
            turn_detection: TurnDetectionConfig {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
            },
            sidecar: SidecarConfig {
                enabled: false,
                url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
                model: "moonshotai/kimi-k2-instruct-0905".to_string(),
                api_key_env: "GROQ_API_KEY".to_string(),
                temperature: 0.6,
                max_tokens: 4096,
                timeout_secs: 60,
            },
        }
    }
}

impl AudioSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn speaking_release(&self) -> Duration {
        Duration::from_millis(self.speaking_release_ms)
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override relay port
    /// - `APP_AUDIO__ECHO_POLICY=block`: Drop suspected echo blocks
    /// - `APP_CLIENT__ENDPOINT=ws://relay:8080/ws/relay`: Point the client elsewhere
    /// - `HOST` / `PORT`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.block_size == 0 {
            return Err(anyhow::anyhow!("Audio block size must be greater than 0"));
        }

        if !self.audio.fft_size.is_power_of_two() || self.audio.fft_size < 256 {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two of at least 256, got {}",
                self.audio.fft_size
            ));
        }

        if !(self.audio.echo_threshold.is_finite() && self.audio.echo_threshold > 0.0) {
            return Err(anyhow::anyhow!("Echo threshold must be a positive number"));
        }

        if !(self.audio.calibration_sigma.is_finite() && self.audio.calibration_sigma >= 0.0) {
            return Err(anyhow::anyhow!("Calibration sigma must be a non-negative number"));
        }

        if !(self.audio.calibration_floor.is_finite() && self.audio.calibration_floor > 0.0) {
            return Err(anyhow::anyhow!("Calibration floor must be a positive number"));
        }

        if self.session.monitor_interval_ms == 0 {
            return Err(anyhow::anyhow!("Monitor interval must be greater than 0"));
        }

        if self.session.early_exit_after_secs >= self.session.max_duration_secs {
            return Err(anyhow::anyhow!(
                "Early exit threshold ({}s) must be below the maximum duration ({}s)",
                self.session.early_exit_after_secs,
                self.session.max_duration_secs
            ));
        }

        if !(self.client.endpoint.starts_with("ws://") || self.client.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Client endpoint must be a ws:// or wss:// URL"));
        }

        if self.sidecar.enabled {
            if !(self.sidecar.url.starts_with("http://") || self.sidecar.url.starts_with("https://")) {
                return Err(anyhow::anyhow!("Sidecar URL must be an http:// or https:// URL"));
            }
            if self.sidecar.model.trim().is_empty() {
                return Err(anyhow::anyhow!("Sidecar model cannot be empty"));
            }
            if self.sidecar.timeout_secs == 0 {
                return Err(anyhow::anyhow!("Sidecar timeout must be greater than 0"));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example, `{"upstream": {"strip_tools": true}}`
    /// flips tool stripping for new relay connections and leaves everything else alone.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} out of range", port))?;
            }
        }

        if let Some(upstream) = partial.get("upstream") {
            if let Some(url) = upstream.get("url").and_then(|v| v.as_str()) {
                self.upstream.url = url.to_string();
            }
            if let Some(model) = upstream.get("transcription_model").and_then(|v| v.as_str()) {
                self.upstream.transcription_model = model.to_string();
            }
            if let Some(flag) = upstream.get("force_input_transcription").and_then(|v| v.as_bool()) {
                self.upstream.force_input_transcription = flag;
            }
            if let Some(flag) = upstream.get("strip_tools").and_then(|v| v.as_bool()) {
                self.upstream.strip_tools = flag;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(ms) = audio.get("cooldown_ms").and_then(|v| v.as_u64()) {
                self.audio.cooldown_ms = ms;
            }
            if let Some(ms) = audio.get("speaking_release_ms").and_then(|v| v.as_u64()) {
                self.audio.speaking_release_ms = ms;
            }
            if let Some(threshold) = audio.get("echo_threshold").and_then(|v| v.as_f64()) {
                self.audio.echo_threshold = threshold as f32;
            }
            if let Some(policy) = audio.get("echo_policy") {
                self.audio.echo_policy = serde_json::from_value(policy.clone())?;
            }
        }

        if let Some(sidecar) = partial.get("sidecar") {
            if let Some(flag) = sidecar.get("enabled").and_then(|v| v.as_bool()) {
                self.sidecar.enabled = flag;
            }
            if let Some(url) = sidecar.get("url").and_then(|v| v.as_str()) {
                self.sidecar.url = url.to_string();
            }
            if let Some(model) = sidecar.get("model").and_then(|v| v.as_str()) {
                self.sidecar.model = model.to_string();
            }
        }

        if let Some(session) = partial.get("session") {
            if let Some(secs) = session.get("max_duration_secs").and_then(|v| v.as_u64()) {
                self.session.max_duration_secs = secs;
            }
            if let Some(secs) = session.get("early_exit_after_secs").and_then(|v| v.as_u64()) {
                self.session.early_exit_after_secs = secs;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
