use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use glass_core::wire::TelemetryMessage;
use glass_sync::device_sync::DEFAULT_HTTP_URL;
use glass_sync::room_sync::DEFAULT_ROOM_SERVER;
use glass_sync::{
    ConnectionConfig, ConnectionState, DeviceSyncClient, DeviceSyncConfig, GlassRuntime,
    RoomSyncClient, RoomSyncConfig, SyncEvent, WidgetHandler,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glass")]
#[command(about = "SimGlass sync CLI", long_about = None)]
struct Cli {
    /// Storage file shared by every glass invocation.
    #[arg(long, global = true)]
    storage: Option<PathBuf>,
    /// Session API base URL (falls back to GLASS_SERVER_URL).
    #[arg(long, global = true)]
    server: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Device sessions over the HTTP API
    Session {
        #[command(subcommand)]
        action: SessionCommands,
    },
    /// Shared-cockpit rooms
    Room {
        #[arg(long, default_value = DEFAULT_ROOM_SERVER)]
        url: String,
        #[arg(long, default_value = "cli")]
        widget: String,
        #[command(subcommand)]
        action: RoomCommands,
    },
    /// Print telemetry from a widget socket
    Telemetry {
        #[arg(long)]
        url: Option<String>,
        /// Send this command once connected.
        #[arg(long)]
        command: Option<String>,
        #[arg(long, default_value = "null")]
        value: String,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    Create {
        #[arg(long, default_value = "glass-cli")]
        name: String,
    },
    Join {
        session_id: String,
        #[arg(long, default_value = "glass-cli")]
        name: String,
    },
    List,
    Leave,
    /// Merge `{widget: value}` into the current session state.
    Set { widget: String, value: String },
    /// Print state updates until interrupted.
    Watch,
}

#[derive(Subcommand)]
enum RoomCommands {
    Create { pilot: String },
    Join { code: String, pilot: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let runtime = GlassRuntime::open(storage_path(cli.storage)?)
        .context("Failed to open glass storage")?;
    let tab = runtime.tab();

    match cli.command {
        Commands::Session { action } => {
            let config = DeviceSyncConfig {
                server_url: server_url(cli.server),
                device_name: "glass-cli".to_string(),
                ..DeviceSyncConfig::default()
            };
            let client = tab.device_sync(config)?;
            let result = run_session(&client, action).await;
            client.close();
            result?;
        }
        Commands::Room {
            url,
            widget,
            action,
        } => {
            let client = RoomSyncClient::new(RoomSyncConfig {
                server_url: url,
                ..RoomSyncConfig::new(widget)
            })?;
            run_room(client, action).await?;
        }
        Commands::Telemetry {
            url,
            command,
            value,
        } => {
            let value: Value = serde_json::from_str(&value).context("--value must be JSON")?;
            run_telemetry(&tab, url, command, value).await?;
        }
    }

    Ok(())
}

fn init_logging() {
    let level = std::env::var("GLASS_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn storage_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("No config directory; pass --storage"))?
        .join("simglass");
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {dir:?}"))?;
    Ok(dir.join("storage.json"))
}

fn server_url(flag: Option<String>) -> String {
    flag.filter(|value| !value.trim().is_empty())
        .or_else(|| std::env::var("GLASS_SERVER_URL").ok())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HTTP_URL.to_string())
}

async fn run_session(client: &DeviceSyncClient, action: SessionCommands) -> Result<()> {
    match action {
        SessionCommands::Create { name } => {
            let outcome = client.create_session(&name).await;
            let session_id = outcome
                .session_id
                .ok_or_else(|| anyhow!(outcome.error.unwrap_or_default()))?;
            println!("Session {session_id}");
            println!("Code    {}", glass_core::session_code(&session_id));
        }
        SessionCommands::Join { session_id, name } => {
            let outcome = client.join_session(&session_id, &name).await;
            if !outcome.success {
                bail!(outcome.error.unwrap_or_default());
            }
            println!("Joined {session_id} ({} participants)", client.participants().len());
        }
        SessionCommands::List => {
            let sessions = client.list_sessions().await?;
            if sessions.is_empty() {
                println!("No active sessions");
            }
            for session in sessions {
                println!(
                    "{}  {}  participants={}  last_update={}",
                    session.code, session.session_id, session.participants, session.last_update
                );
            }
        }
        SessionCommands::Leave => {
            resume(client).await?;
            let outcome = client.leave_session().await;
            if !outcome.success {
                bail!(outcome.error.unwrap_or_default());
            }
            println!("Left session");
        }
        SessionCommands::Set { widget, value } => {
            resume(client).await?;
            let value: Value = serde_json::from_str(&value).context("value must be JSON")?;
            let mut update = glass_core::WidgetState::new();
            update.insert(widget, value);
            let outcome = client.update_state(update).await;
            if !outcome.success {
                bail!(outcome.error.unwrap_or_default());
            }
        }
        SessionCommands::Watch => {
            resume(client).await?;
            let mut events = client.subscribe();
            println!("Watching {}", client.session_code().unwrap_or_default());
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SyncEvent::StateUpdate { state }) => {
                            println!("{}", Value::Object(state));
                        }
                        Ok(SyncEvent::Error { message }) => eprintln!("error: {message}"),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }
    Ok(())
}

async fn resume(client: &DeviceSyncClient) -> Result<()> {
    match client.resume_session().await {
        Some(outcome) if outcome.success => Ok(()),
        Some(outcome) => bail!(outcome.error.unwrap_or_default()),
        None => bail!("Not in a session; run `glass session create` or `join` first"),
    }
}

async fn run_room(client: RoomSyncClient, action: RoomCommands) -> Result<()> {
    let client = Arc::new(client);
    client
        .on_room_created(|room| println!("Room {} created; you are {}", room.room_code, room.role))
        .on_room_joined(|room| {
            println!(
                "Joined {} as {} ({} pilots)",
                room.room_code,
                room.role,
                room.pilots.len()
            )
        })
        .on_pilot_joined(|change| println!("{} joined", change.pilot_name))
        .on_pilot_left(|change| println!("{} left", change.pilot_name))
        .on_chat(|chat| {
            println!(
                "<{}> {}",
                chat.from.as_deref().unwrap_or("?"),
                chat.message
            )
        })
        .on_state_update(|update| println!("state {}", update.state))
        .on_error(|message| eprintln!("error: {message}"));

    client.connect().await?;
    let sent = match &action {
        RoomCommands::Create { pilot } => client.create_room(pilot),
        RoomCommands::Join { code, pilot } => client.join_room(code, pilot),
    };
    if !sent {
        bail!("Room relay not connected");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/leave" => {
                    client.leave_room();
                    break;
                }
                Some(line) if !line.trim().is_empty() => {
                    if !client.send_chat(line.trim()) {
                        eprintln!("not connected; message dropped");
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.disconnect();
    Ok(())
}

struct PrintTelemetry;

impl WidgetHandler for PrintTelemetry {
    fn on_connect(&mut self) {
        eprintln!("connected");
    }

    fn on_message(&mut self, message: TelemetryMessage) {
        match serde_json::to_string(&message) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("unprintable message: {err}"),
        }
    }

    fn on_disconnect(&mut self) {
        eprintln!("disconnected; retrying");
    }
}

async fn run_telemetry(
    tab: &glass_sync::TabContext,
    url: Option<String>,
    command: Option<String>,
    value: Value,
) -> Result<()> {
    let connection = tab.widget_connection(
        ConnectionConfig {
            server_url: url,
            status_element_id: Some("glass-cli".to_string()),
            ..ConnectionConfig::default()
        },
        PrintTelemetry,
    )?;

    if let Some(command) = command {
        let mut state = connection.subscribe_state();
        while *state.borrow_and_update() != ConnectionState::Connected {
            state
                .changed()
                .await
                .map_err(|_| anyhow!("connection closed"))?;
        }
        connection.send_command(&command, value);
    }

    tokio::signal::ctrl_c().await?;
    connection.destroy();
    Ok(())
}
