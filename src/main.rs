use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amps::config::{resolve_config_path, AppConfig};
use amps::web::WebServer;

/// Exit code for configuration problems
const EXIT_CONFIG: u8 = 1;
/// Exit code when a client command cannot reach the server
const EXIT_UNREACHABLE: u8 = 2;

#[derive(Parser)]
#[command(name = "amps")]
#[command(version)]
#[command(about = "Amps - Advanced Media Playlist Server")]
#[command(
    long_about = "A dynamic M3U playlist and media streaming server powered by FFmpeg."
)]
struct Cli {
    /// Configuration file path (falls back to $AMPS_CONFIG, then config.yaml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Amps server
    Serve,
    /// List streams from the configuration
    List,
    /// Show live transcoders on a running server
    Tuners,
    /// Gracefully stop a running server
    Shutdown,
    /// Launch VLC against a configured stream
    Vlc {
        #[arg(long, default_value_t = 1)]
        stream_id: u32,
        /// Region code to present to the server
        #[arg(long)]
        region: Option<String>,
        /// Adaptive bitrate variant name to request
        #[arg(long)]
        variant: Option<String>,
        /// Request a dedicated transcoder instead of sharing
        #[arg(long)]
        overlap: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("amps={}", cli.log_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, error)) => {
            eprintln!("error: {error:#}");
            ExitCode::from(code)
        }
    }
}

fn load_config(cli_path: Option<&str>) -> Result<AppConfig, (u8, anyhow::Error)> {
    let path = resolve_config_path(cli_path);
    AppConfig::load_from_file(&path).map_err(|e| (EXIT_CONFIG, e))
}

fn run(cli: Cli) -> Result<(), (u8, anyhow::Error)> {
    match cli.command {
        Commands::Serve => {
            let config = load_config(cli.config.as_deref())?;
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            if let Some(workers) = config.server.workers {
                builder.worker_threads(workers);
            }
            let runtime = builder
                .enable_all()
                .build()
                .map_err(|e| (EXIT_CONFIG, e.into()))?;

            info!(
                "Amps serving {} stream(s) at http://{}:{}",
                config.streams.len(),
                config.server.host,
                config.server.port
            );
            runtime
                .block_on(async { WebServer::from_config(config).serve().await })
                .map_err(|e| (EXIT_CONFIG, e))
        }
        Commands::List => {
            let config = load_config(cli.config.as_deref())?;
            if config.streams.is_empty() {
                println!("No streams found in the configuration.");
                return Ok(());
            }
            println!("Available Streams:");
            for stream in &config.streams {
                let profile_label = match (&stream.custom_ffmpeg, &stream.ffmpeg_profile) {
                    (Some(_), Some(profile)) => format!("{profile} (custom override)"),
                    (Some(_), None) => "custom command".to_string(),
                    (None, Some(profile)) => profile.clone(),
                    (None, None) => "-".to_string(),
                };
                println!(
                    "  - ID: {}, Name: {}, Profile: {}, Logo: {}",
                    stream.id,
                    stream.name,
                    profile_label,
                    stream.logo.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::Tuners => {
            let config = load_config(cli.config.as_deref())?;
            client_runtime()?.block_on(async {
                let body: serde_json::Value =
                    client_get(&config, "/api/tuners").await?.json().await.map_err(
                        |e| (EXIT_UNREACHABLE, anyhow::Error::from(e)),
                    )?;
                let tuners = body["tuners"].as_array().cloned().unwrap_or_default();
                if tuners.is_empty() {
                    println!("No live transcoders.");
                    return Ok(());
                }
                println!("Live transcoders:");
                for tuner in tuners {
                    println!(
                        "  - {} pid={} subscribers={} restarts={} since {}",
                        tuner["key"].as_str().unwrap_or("?"),
                        tuner["pid"].as_u64().unwrap_or(0),
                        tuner["subscribers"].as_u64().unwrap_or(0),
                        tuner["restarts"].as_u64().unwrap_or(0),
                        tuner["started_at"].as_str().unwrap_or("?"),
                    );
                }
                Ok(())
            })
        }
        Commands::Shutdown => {
            let config = load_config(cli.config.as_deref())?;
            client_runtime()?.block_on(async {
                let client = reqwest::Client::new();
                let mut request = client.post(server_url(&config, "/api/shutdown"));
                if let Some(token) = config.server.token.as_deref() {
                    request = request.bearer_auth(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| (EXIT_UNREACHABLE, anyhow::Error::from(e)))?;
                if response.status().is_success() {
                    println!("Server is shutting down.");
                    Ok(())
                } else {
                    Err((
                        EXIT_CONFIG,
                        anyhow::anyhow!("server refused shutdown: {}", response.status()),
                    ))
                }
            })
        }
        Commands::Vlc {
            stream_id,
            region,
            variant,
            overlap,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let mut pairs = url::form_urlencoded::Serializer::new(String::new());
            if let Some(token) = config.server.token.as_deref() {
                pairs.append_pair("token", token);
            }
            if let Some(region) = region {
                pairs.append_pair("region", &region);
            }
            if let Some(variant) = variant {
                pairs.append_pair("variant", &variant);
            }
            if overlap {
                pairs.append_pair("overlap", "true");
            }
            let query = pairs.finish();
            let mut url = server_url(&config, &format!("/stream/{stream_id}"));
            if !query.is_empty() {
                url.push('?');
                url.push_str(&query);
            }

            println!("Starting VLC with URL: {url}");
            match std::process::Command::new("vlc").arg(&url).status() {
                Ok(_) => Ok(()),
                Err(e) => Err((
                    EXIT_CONFIG,
                    anyhow::anyhow!("VLC is not installed or not found in PATH: {e}"),
                )),
            }
        }
    }
}

fn client_runtime() -> Result<tokio::runtime::Runtime, (u8, anyhow::Error)> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| (EXIT_CONFIG, e.into()))
}

/// Loopback-friendly base URL for client commands
fn server_url(config: &AppConfig, path: &str) -> String {
    let host = match config.server.host.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        host => host,
    };
    format!("http://{host}:{}{path}", config.server.port)
}

async fn client_get(
    config: &AppConfig,
    path: &str,
) -> Result<reqwest::Response, (u8, anyhow::Error)> {
    let client = reqwest::Client::new();
    let mut request = client.get(server_url(config, path));
    if let Some(token) = config.server.token.as_deref() {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| (EXIT_UNREACHABLE, anyhow::Error::from(e)))?;
    if !response.status().is_success() {
        return Err((
            EXIT_CONFIG,
            anyhow::anyhow!("server responded with {}", response.status()),
        ));
    }
    Ok(response)
}
