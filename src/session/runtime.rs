//! # Session Runtime
//!
//! Wires a [`ConversationSession`] to the real world and drives it from one
//! cooperative event loop.
//!
//! ## Event Loop:
//! ```text
//! microphone blocks ─┐
//! websocket frames  ─┤
//! mixer completions ─┼─► select! ─► ConversationSession ─► actions ─► socket / console
//! release + monitor ─┤
//! stdin commands    ─┘
//! ```
//!
//! The loop runs on the current thread; the audio streams are not `Send` and never
//! leave it. Device callbacks only talk to the loop through channels.

use crate::assessment::model::SessionState;
use crate::audio::codec::WIRE_SAMPLE_RATE;
use crate::audio::playback::PlaybackSink;
use crate::config::AppConfig;
use crate::device::{AudioDevices, DroppedBlocks};
use crate::error::{AppError, AppResult};
use crate::session::controller::{ConversationSession, SessionAction, SessionEnd, UserCommand};
use crate::session::report::ReportClient;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const RELEASE_TICK: Duration = Duration::from_millis(50);
const BLOCK_QUEUE: usize = 32;

/// How a finished session turned out.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub state: SessionState,
}

/// Socket and audio streams of one session, released together.
pub struct Connection {
    sink: Option<WsSink>,
    input: Option<cpal::Stream>,
    output: Option<cpal::Stream>,
}

impl Connection {
    async fn send(&mut self, text: String) -> AppResult<()> {
        match self.sink.as_mut() {
            Some(sink) => Ok(sink.send(Message::Text(text)).await?),
            None => Err(AppError::Transport("connection already closed".to_string())),
        }
    }

    /// Stop the microphone, the speaker and the socket. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if self.input.take().is_some() {
            debug!("Microphone stream released");
        }
        if self.output.take().is_some() {
            debug!("Speaker stream released");
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.send(Message::Close(None)).await {
                debug!(error = %err, "Close frame not delivered");
            }
            let _ = sink.close().await;
            info!("Disconnected from agent");
        }
    }
}

/// Run one voice session to completion.
///
/// Device and connection failures before the conversation starts are returned as
/// errors; everything after that ends up in the summary.
pub async fn run_session(config: AppConfig) -> AppResult<SessionSummary> {
    let devices = AudioDevices::open_default()?;

    info!(endpoint = %config.client.endpoint, "Connecting to agent");
    let (socket, _response) = connect_async(config.client.endpoint.as_str())
        .await
        .map_err(|e| AppError::Transport(format!("could not connect to {}: {}", config.client.endpoint, e)))?;
    let (sink, mut inbound) = socket.split();

    let (block_tx, mut block_rx) = mpsc::channel::<Vec<f32>>(BLOCK_QUEUE);
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();

    let mut connection = Connection {
        sink: Some(sink),
        input: None,
        output: None,
    };
    let (output, mixer) = devices.start_playback(ended_tx)?;
    connection.output = Some(output);
    let (input, mut drops) = devices.start_capture(WIRE_SAMPLE_RATE, config.audio.block_size, block_tx)?;
    connection.input = Some(input);

    let mut session = ConversationSession::new(&config, mixer, Instant::now());
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    spawn_stdin_reader(command_tx);

    let mut monitor = tokio::time::interval(session.monitor_interval());
    let mut release = tokio::time::interval(RELEASE_TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("Controls: m = mute, p = pause, f = finish, q = quit");
    let opening = session.start();
    let mut end = execute(&mut session, &mut connection, opening).await;

    while end.is_none() {
        let actions = tokio::select! {
            Some(block) = block_rx.recv() => session.on_audio_block(&block, Instant::now()),
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => session.on_raw_inbound(&text, Instant::now()),
                Some(Ok(Message::Close(reason))) => {
                    let detail = reason
                        .map(|f| format!("closed by remote ({}: {})", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by remote".to_string());
                    session.on_transport_error(AppError::Transport(detail))
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => session.on_transport_error(err.into()),
                None => session.on_transport_error(AppError::Transport("connection closed".to_string())),
            },
            Some(id) = ended_rx.recv() => {
                session.on_playback_ended(id, Instant::now());
                Vec::new()
            }
            _ = release.tick() => {
                session.on_release_tick(Instant::now());
                Vec::new()
            }
            _ = monitor.tick() => {
                report_dropped_blocks(&mut drops);
                session.on_monitor_tick(Instant::now())
            }
            Some(command) = command_rx.recv() => session.on_command(command),
            _ = &mut ctrl_c => session.on_command(UserCommand::Quit),
        };
        end = execute(&mut session, &mut connection, actions).await;
    }

    connection.disconnect().await;

    info!(
        session_id = %session.id(),
        user_turns = session.history().user_turns(),
        agent_turns = session.history().agent_turns(),
        "Conversation transcript closed"
    );

    let end = end.unwrap_or(SessionEnd::UserStopped);
    let state = session.snapshot();
    if end.should_report() {
        submit_report(&config, &state).await;
    }
    Ok(SessionSummary { end, state })
}

/// Carry out actions, feeding transport failures back into the session.
async fn execute<S: PlaybackSink>(
    session: &mut ConversationSession<S>,
    connection: &mut Connection,
    actions: Vec<SessionAction>,
) -> Option<SessionEnd> {
    let mut queue: VecDeque<SessionAction> = actions.into();
    let mut end = None;

    while let Some(action) = queue.pop_front() {
        match action {
            SessionAction::Send(message) => {
                if end.is_some() {
                    continue;
                }
                let kind = message.kind();
                let sent = match message.to_json() {
                    Ok(text) => connection.send(text).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    error!(kind, error = %err, "Failed to send message");
                    queue.extend(session.on_transport_error(err));
                }
            }
            SessionAction::Status(line) => {
                info!(status = %line, "Session status");
                println!("{}", line);
            }
            SessionAction::Close(reason) => {
                end.get_or_insert(reason);
            }
        }
    }
    end
}

fn report_dropped_blocks(drops: &mut DroppedBlocks) {
    let dropped = drops.take_new();
    if dropped > 0 {
        warn!(dropped, "Event loop behind, microphone blocks dropped");
    }
}

fn spawn_stdin_reader(tx: mpsc::UnboundedSender<UserCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match UserCommand::parse(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None => println!("Unknown command '{}'. Use m, p, f or q.", line.trim()),
            }
        }
    });
}

async fn submit_report(config: &AppConfig, state: &SessionState) {
    let (Some(endpoint), Some(email)) = (&config.client.report_endpoint, &config.client.email) else {
        debug!("No report endpoint or email configured, skipping report");
        return;
    };

    let result = match ReportClient::new(endpoint.clone()) {
        Ok(client) => client.finalize(email, state).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => println!("Your report is on its way to {}.", email),
        Err(err) => {
            warn!(error = %err, "Report submission failed");
            println!("Could not submit your report: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_disconnect_twice_without_streams() {
        let mut connection = Connection {
            sink: None,
            input: None,
            output: None,
        };

        connection.disconnect().await;
        connection.disconnect().await;

        assert!(connection.sink.is_none());
        assert!(connection.input.is_none());
        assert!(connection.output.is_none());
        assert!(matches!(
            connection.send("{}".to_string()).await,
            Err(AppError::Transport(_))
        ));
    }
}
