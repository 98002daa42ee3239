use anyhow::Context;
use clap::{ArgGroup, Parser};
use gateway_bridge::config::{DEFAULT_HEARTBEAT_SECS, DEFAULT_MESSAGE_PATH, DEFAULT_SSE_PATH};
use gateway_bridge::logging::init_logging;
use gateway_bridge::{BridgeConfig, CorsPolicy, OutputTransport, start_bridge};
use gateway_client::relay::{RelayConfig, request_timeout_secs, run_stdio_relay};
use gateway_client::transport::{DEFAULT_CONNECT_TIMEOUT_SECS, RemoteConfig, RemoteKind};
use gateway_common::headers::parse_header_arg;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Bridge between a stdio JSON-RPC server and network clients.
///
/// With `--stdio`, one server process is exposed over SSE or WebSocket and
/// its output is broadcast to every connected client. With `--sse` or `--ws`,
/// a remote server is exposed as a stdio server on this process's stdin and
/// stdout.
#[derive(Parser, Debug)]
#[command(name = "stdio_gateway")]
#[command(version, about)]
#[command(group(ArgGroup::new("mode").required(true).args(["stdio", "sse", "ws"])))]
struct Args {
    /// Command of the stdio server to expose. Arguments follow `--`.
    #[arg(long, value_name = "COMMAND")]
    stdio: Option<String>,

    /// Arguments for the `--stdio` command.
    #[arg(last = true, value_name = "ARGS")]
    server_args: Vec<String>,

    /// Remote SSE endpoint to expose over stdio.
    #[arg(long, value_name = "URL")]
    sse: Option<Url>,

    /// Remote WebSocket endpoint to expose over stdio.
    #[arg(long, value_name = "URL")]
    ws: Option<Url>,

    /// Transport offered to network clients in `--stdio` mode.
    #[arg(long, value_enum, default_value_t = OutputTransport::Sse)]
    output_transport: OutputTransport,

    /// Address to bind the HTTP server.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind_addr: SocketAddr,

    /// Path of the SSE stream.
    #[arg(long, default_value = DEFAULT_SSE_PATH)]
    sse_path: String,

    /// Path for POSTed messages (SSE) or WebSocket upgrades.
    #[arg(long, default_value = DEFAULT_MESSAGE_PATH)]
    message_path: String,

    /// Extra header as `Name: value`. Repeatable. Sent on HTTP responses in
    /// `--stdio` mode and on upstream requests otherwise.
    #[arg(long = "header", value_name = "HEADER", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Path that answers `200 ok`. Repeatable.
    #[arg(long = "health-endpoint", value_name = "PATH")]
    health_endpoints: Vec<String>,

    /// Enable CORS. Without origins any origin is allowed.
    #[arg(long, num_args = 0.., value_name = "ORIGIN")]
    cors: Option<Vec<String>>,

    /// Seconds between heartbeats on each session. 0 disables them.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_SECS)]
    heartbeat_secs: u64,

    /// Seconds to wait for a remote response before answering with an error.
    /// Defaults to STDIO_GATEWAY_REQUEST_TIMEOUT_SECS, or 30.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Seconds allowed to connect to the remote.
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,

    /// Skip the relay's own `initialize` exchange with the remote.
    #[arg(long)]
    no_bootstrap: bool,

    /// Enable colored terminal output for process I/O (debug mode).
    #[arg(long)]
    colored_output: bool,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    parse_header_arg(raw).map_err(|e| e.to_string())
}

fn cors_policy(cors: Option<Vec<String>>) -> CorsPolicy {
    match cors {
        None => CorsPolicy::Disabled,
        Some(origins) if origins.is_empty() => CorsPolicy::AnyOrigin,
        Some(origins) => CorsPolicy::Origins(origins),
    }
}

fn bridge_config(command: String, args: Args) -> BridgeConfig {
    BridgeConfig {
        bind_addr: args.bind_addr,
        server_command: command,
        server_args: args.server_args,
        output_transport: args.output_transport,
        sse_path: args.sse_path,
        message_path: args.message_path,
        health_endpoints: args.health_endpoints,
        headers: args.headers,
        cors: cors_policy(args.cors),
        heartbeat_interval: (args.heartbeat_secs > 0).then(|| Duration::from_secs(args.heartbeat_secs)),
        enable_colored_output: args.colored_output,
        ..BridgeConfig::default()
    }
}

fn relay_config(url: Url, kind: RemoteKind, args: &Args) -> RelayConfig {
    let remote = RemoteConfig {
        headers: args.headers.clone(),
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        ..RemoteConfig::new(url, kind)
    };
    RelayConfig {
        remote,
        request_timeout: Duration::from_secs(args.request_timeout_secs.unwrap_or_else(request_timeout_secs)),
        bootstrap: !args.no_bootstrap,
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    if let Some(command) = args.stdio.clone() {
        let config = bridge_config(command, args);
        tracing::info!("Proxying to command: {}", config.server_command);
        let code = start_bridge(config)
            .await
            .context("stdio bridge failed")?;
        return Ok(code);
    }

    let config = match (args.sse.clone(), args.ws.clone()) {
        (Some(url), _) => relay_config(url, RemoteKind::Sse, &args),
        (None, Some(url)) => relay_config(url, RemoteKind::Ws, &args),
        (None, None) => anyhow::bail!("one of --stdio, --sse or --ws is required"),
    };
    tracing::info!(url = %config.remote.url, "Relaying stdio to remote server");
    run_stdio_relay(config).await.context("relay failed")?;
    Ok(0)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}
