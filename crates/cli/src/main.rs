use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Slack message relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway (HTTP API, Slack events webhook, and Socket Mode when an app token is configured).
    Gateway {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from PORT, config, or 5000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Create the message database and schema without starting the gateway.
    InitDb {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Send a message through a running gateway.
    Send {
        /// Slack user id; without --channel the message goes to their direct channel.
        #[arg(long, short)]
        user: String,

        #[arg(long)]
        channel: Option<String>,

        #[arg(long, short)]
        text: String,

        /// Gateway base URL (default http://127.0.0.1:<port from config>)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// List recorded messages from a running gateway, newest first.
    Messages {
        #[arg(long, short)]
        user: Option<String>,

        #[arg(long)]
        channel: Option<String>,

        /// incoming or outgoing
        #[arg(long, short)]
        direction: Option<String>,

        #[arg(long, short)]
        limit: Option<u32>,

        #[arg(long)]
        offset: Option<u32>,

        /// Gateway base URL (default http://127.0.0.1:<port from config>)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::InitDb { config }) => run_init_db(config).await,
        Some(Commands::Send {
            user,
            channel,
            text,
            url,
        }) => run_send(user, channel, text, url).await,
        Some(Commands::Messages {
            user,
            channel,
            direction,
            limit,
            offset,
            url,
        }) => run_messages(user, channel, direction, limit, offset, url).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    lib::config::apply_port_override(&mut config);
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path).await
}

async fn run_init_db(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let db_path = lib::config::resolve_database_path(&config, &path);
    let store = lib::store::MessageStore::open(&db_path).await?;
    let existing = store.count(&Default::default()).await?;
    store.close().await;
    println!(
        "database ready at {} ({} messages)",
        db_path.display(),
        existing
    );
    Ok(())
}

fn gateway_url(url: Option<String>) -> anyhow::Result<String> {
    if let Some(u) = url {
        return Ok(u.trim_end_matches('/').to_string());
    }
    let (mut config, _) = lib::config::load_config(None)?;
    lib::config::apply_port_override(&mut config);
    Ok(format!("http://127.0.0.1:{}", config.gateway.port))
}

fn error_text(body: &Value) -> String {
    body.get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("request failed")
        .to_string()
}

async fn run_send(
    user: String,
    channel: Option<String>,
    text: String,
    url: Option<String>,
) -> anyhow::Result<()> {
    let base = gateway_url(url)?;
    let mut body = serde_json::json!({ "user_id": user, "text": text });
    if let Some(c) = channel {
        body["channel_id"] = Value::String(c);
    }
    let res = reqwest::Client::new()
        .post(format!("{}/api/send-message", base))
        .json(&body)
        .send()
        .await?;
    let status = res.status();
    let reply: Value = res.json().await?;
    if !status.is_success() {
        anyhow::bail!("send failed ({}): {}", status, error_text(&reply));
    }
    let message = &reply["message"];
    println!(
        "sent to {} at {}",
        message["channel_id"].as_str().unwrap_or("?"),
        message["timestamp"].as_str().unwrap_or("?")
    );
    Ok(())
}

async fn run_messages(
    user: Option<String>,
    channel: Option<String>,
    direction: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let base = gateway_url(url)?;
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(u) = user {
        query.push(("user_id", u));
    }
    if let Some(c) = channel {
        query.push(("channel_id", c));
    }
    if let Some(d) = direction {
        query.push(("direction", d));
    }
    if let Some(l) = limit {
        query.push(("limit", l.to_string()));
    }
    if let Some(o) = offset {
        query.push(("offset", o.to_string()));
    }
    let res = reqwest::Client::new()
        .get(format!("{}/api/messages", base))
        .query(&query)
        .send()
        .await?;
    let status = res.status();
    let reply: Value = res.json().await?;
    if !status.is_success() {
        anyhow::bail!("query failed ({}): {}", status, error_text(&reply));
    }

    let messages = reply["messages"].as_array().cloned().unwrap_or_default();
    for m in &messages {
        let arrow = if m["direction"] == "outgoing" { "→" } else { "←" };
        println!(
            "[{}] {} {} {}: {}",
            m["timestamp"].as_str().unwrap_or(""),
            arrow,
            m["channel_id"].as_str().unwrap_or(""),
            m["user_id"].as_str().unwrap_or(""),
            m["message_text"].as_str().unwrap_or("")
        );
    }
    println!("{} message(s)", reply["count"]);
    Ok(())
}
