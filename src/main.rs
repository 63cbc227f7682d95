//! # Agent Voice - Main Application Entry Point
//!
//! One binary, two roles:
//! - **serve**: the relay server. Voice clients connect to `/ws/relay` and are
//!   forwarded to the realtime agent, which keeps the agent's API key on the server.
//! - **talk**: the voice client. Streams the microphone to the agent, plays its speech
//!   back, and builds the assessment record from its structured updates.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **error**: error taxonomy and HTTP error responses
//! - **protocol**: realtime wire messages
//! - **audio**: codec, spectral heuristics, capture gating, playback scheduling, mixing
//! - **assessment**: session record model, patch parsing, merge store
//! - **session**: the client's session controller, monitor, runtime and report hand-off
//! - **device**: microphone and speaker through cpal
//! - **relay / sidecar / state / health / handlers**: the relay server

mod assessment;
mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod protocol;
mod relay;
mod session;
mod sidecar;
mod state;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use assessment::model::{display_score, Dimension};
use clap::{Parser, Subcommand};
use config::AppConfig;
use device::AudioDevices;
use session::controller::SessionEnd;
use session::runtime::{run_session, SessionSummary};
use state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agent-voice", version, about = "Realtime voice assessment client and relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default)
    Serve,
    /// Start a voice session
    Talk {
        /// Websocket endpoint of the relay or agent
        #[arg(long)]
        endpoint: Option<String>,
        /// Address the finished report is sent to
        #[arg(long)]
        email: Option<String>,
        /// Service that receives the finished assessment
        #[arg(long)]
        report_endpoint: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
    /// List available microphones
    Devices,
}

/// The main application entry point.
///
/// `#[actix_web::main]` runs everything on a single-threaded runtime, which is what
/// the voice session's event loop expects.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Talk {
            endpoint,
            email,
            report_endpoint,
        } => {
            let mut config = config;
            if let Some(endpoint) = endpoint {
                config.client.endpoint = endpoint;
            }
            if email.is_some() {
                config.client.email = email;
            }
            if report_endpoint.is_some() {
                config.client.report_endpoint = report_endpoint;
            }
            config.validate()?;
            talk(config).await
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Devices => {
            for name in AudioDevices::list_input_devices().map_err(|e| anyhow::anyhow!(e))? {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting agent-voice relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Upstream agent: {}", config.upstream.url);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::detailed_health))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/relay/sessions", web::get().to(handlers::list_relay_sessions)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/relay", web::get().to(relay::relay_websocket))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn talk(config: AppConfig) -> Result<()> {
    match run_session(config).await {
        Ok(summary) => {
            print_summary(&summary);
            if let SessionEnd::Failed(_) = summary.end {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "Voice session could not start");
            eprintln!("{}", err.status_message());
            std::process::exit(1);
        }
    }
}

fn print_summary(summary: &SessionSummary) {
    let state = &summary.state;
    println!();
    println!("Session ended: {:?}", summary.end);
    println!("Phase reached: {}", state.conversation_phase);
    for dimension in Dimension::ALL {
        let dim = state.dimension(dimension);
        println!(
            "  {} {:<30} {:>5.1}  ({}, {} evidence, {})",
            dimension.code(),
            dimension.label(),
            display_score(dim.score),
            dim.confidence,
            dim.evidence_count,
            dim.trend
        );
    }
    println!(
        "Evidence items: {}, contradictions: {}",
        state.evidence_log.len(),
        state.contradictions.len()
    );
    if let Some(text) = &state.summary {
        println!("Summary: {}", text);
    }
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "agent_voice=trace")
/// - If not set, defaults to "agent_voice=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_voice=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
