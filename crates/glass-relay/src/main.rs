use clap::Parser;
use glass_relay::{
    logging, serve_split, RelayConfig, RelayState, DEFAULT_ADDR, DEFAULT_LOG_DIR, DEFAULT_ROOM_ADDR,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "glass-relay")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Listener for the room socket alone.
    #[arg(long, default_value = "")]
    room_addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Accept connections from other machines on the network.
    #[arg(long, default_value_t = false)]
    lan: bool,
    #[arg(long, default_value_t = 3600)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

fn load_config() -> RelayConfig {
    let args = Args::parse();
    RelayConfig {
        addr: flag_or_env(&args.addr, "GLASS_RELAY_ADDR", DEFAULT_ADDR),
        room_addr: flag_or_env(&args.room_addr, "GLASS_RELAY_ROOM_ADDR", DEFAULT_ROOM_ADDR),
        debug: args.debug || logging::env_true("GLASS_RELAY_DEBUG"),
        stale_seconds: args.stale_seconds,
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir: flag_or_env(&args.log_dir, "GLASS_LOG_DIR", DEFAULT_LOG_DIR),
        allow_lan: args.lan,
    }
}

fn flag_or_env(flag: &str, key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}

#[tokio::main]
async fn main() {
    let config = load_config();
    if let Some(path) = logging::init_logging(config.debug, &config.log_dir) {
        info!(event = "log_file", path = %path.display());
    }
    let Some(api) = bind(&config.addr, config.allow_lan).await else {
        return;
    };
    let Some(rooms) = bind(&config.room_addr, config.allow_lan).await else {
        return;
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = serve_split(api, rooms, RelayState::new(config), shutdown).await {
        error!(event = "relay_error", error = %err);
    }
}

async fn bind(raw: &str, allow_lan: bool) -> Option<tokio::net::TcpListener> {
    let addr: SocketAddr = match raw.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %raw);
            return None;
        }
    };
    if !allow_lan && !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %raw, reason = "non-loopback needs --lan");
        return None;
    }
    match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => Some(value),
        Err(err) => {
            error!(event = "relay_error", addr = %raw, error = %err);
            None
        }
    }
}
