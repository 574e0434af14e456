//! respconn - command-line RESP client
//!
//! Runs one command from the arguments, or pipelines every line read from
//! stdin over a single connection.

use clap::Parser;
use colored::Colorize;
use respconn_client::{
    Client, ClientError, Command, ConfigError, ConnectionConfig, PushMessage, RespValue,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "respconn")]
#[command(about = "Pipelined command-line client for RESP servers")]
#[command(version)]
struct Cli {
    /// Server address [default: from config, then 127.0.0.1:6379]
    #[arg(short, long)]
    addr: Option<String>,

    /// YAML configuration file
    #[arg(short, long, env = "RESPCONN_CONFIG")]
    config: Option<PathBuf>,

    /// Password sent with AUTH on connect
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Database selected on connect
    #[arg(short = 'n', long)]
    db: Option<u32>,

    /// Print replies as JSON, one per line
    #[arg(long)]
    json: bool,

    /// Subscribe to these channels and print messages until Ctrl+C
    #[arg(long, value_delimiter = ',')]
    subscribe: Option<Vec<String>>,

    /// Command and arguments; reads commands from stdin when omitted
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let addr = config.addr.clone();
    let client = Client::open(config)?;

    if let Some(channels) = cli.subscribe {
        return watch(&client, channels, cli.json).await;
    }

    let commands = if cli.command.is_empty() {
        read_stdin().await?
    } else {
        Command::from_args(cli.command.iter()).into_iter().collect()
    };
    if commands.is_empty() {
        return Ok(());
    }

    tracing::debug!("Pipelining {} commands to {}", commands.len(), addr);
    let replies = client.pipeline(commands);

    let mut failed = false;
    for reply in replies {
        let result = reply.await;
        if let Err(ref e) = result {
            if !matches!(e, ClientError::Server(_)) {
                failed = true;
            }
        }
        if cli.json {
            println!("{}", serde_json::to_string(&to_json(&result))?);
        } else {
            print_result(&result);
        }
    }

    client.shutdown();
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Defaults, then the config file, then `RESPCONN_*` variables, then flags
/// the user actually passed.
fn build_config(cli: &Cli) -> Result<ConnectionConfig, ConfigError> {
    let mut config = ConnectionConfig::load_from(cli.config.as_deref())?;
    if let Some(ref addr) = cli.addr {
        config.addr = addr.clone();
    }
    if let Some(ref password) = cli.password {
        config = config.with_password(password);
    }
    if let Some(db) = cli.db {
        config = config.with_database(db);
    }
    let config = config.with_client_name("respconn-cli").with_reconnect(false);
    config.validate()?;
    Ok(config)
}

/// Parses one command per non-empty line.
async fn read_stdin() -> std::io::Result<Vec<Command>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut commands = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if let Some(command) = Command::from_args(line.split_whitespace()) {
            commands.push(command);
        }
    }
    Ok(commands)
}

async fn watch(
    client: &Client,
    channels: Vec<String>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut pubsub = client.subscriber(&channels).await.map_err(|e| {
        eprintln!("{}: {}", "Subscribe failed".red(), e);
        e
    })?;
    eprintln!("{} {}", "Subscribed to".green(), channels.join(", ").cyan());
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            message = pubsub.next_message() => {
                match message {
                    Some(PushMessage::Confirmation { .. }) => {}
                    Some(PushMessage::Message { channel, payload })
                    | Some(PushMessage::PatternMessage { channel, payload, .. }) => {
                        let channel = String::from_utf8_lossy(&channel);
                        let payload = String::from_utf8_lossy(&payload);
                        if json {
                            let event = serde_json::json!({ "channel": channel, "payload": payload });
                            println!("{}", event);
                        } else {
                            println!("{} {}", channel.cyan(), payload);
                        }
                    }
                    Some(PushMessage::Other(value)) => print_value(&value),
                    None => {
                        eprintln!("{}", "Connection closed".red());
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }

    client.shutdown();
    Ok(())
}

fn to_json(result: &Result<RespValue, ClientError>) -> serde_json::Value {
    match result {
        Ok(value) => value.to_json(),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    }
}

fn print_result(result: &Result<RespValue, ClientError>) {
    match result {
        Ok(value) => print_value(value),
        Err(ClientError::Server(msg)) => println!("{}", format!("(error) {}", msg).red()),
        Err(e) => eprintln!("{}: {}", "Error".red(), e),
    }
}

/// Prints a reply the way redis-cli does.
fn print_value(value: &RespValue) {
    for line in render(value) {
        println!("{}", line);
    }
}

fn render(value: &RespValue) -> Vec<String> {
    match value {
        RespValue::SimpleString(s) => vec![String::from_utf8_lossy(s).into_owned()],
        RespValue::BulkString(s) => vec![format!("{:?}", String::from_utf8_lossy(s))],
        RespValue::Integer(n) => vec![format!("(integer) {}", n)],
        RespValue::Null => vec!["(nil)".dimmed().to_string()],
        RespValue::Error(e) => {
            vec![format!("(error) {}", String::from_utf8_lossy(e)).red().to_string()]
        }
        RespValue::Array(items) if items.is_empty() => vec!["(empty array)".to_string()],
        RespValue::Array(items) => {
            let width = items.len().to_string().len();
            let mut lines = Vec::new();
            for (i, item) in items.iter().enumerate() {
                let prefix = format!("{:>width$}) ", i + 1, width = width);
                let pad = " ".repeat(prefix.len());
                for (j, line) in render(item).into_iter().enumerate() {
                    let lead = if j == 0 { &prefix } else { &pad };
                    lines.push(format!("{}{}", lead, line));
                }
            }
            lines
        }
    }
}
