#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relay-console
//!
//! Operator console for driving browser extensions through a relay server.
//!
//! ## Subcommands
//!
//! - `relay-console run` (default) — interactive console on stdin
//! - `relay-console probe <url>` — one-shot connection test, prints JSON
//!
//! ## Console commands
//!
//! | Command                     | Description                              |
//! |-----------------------------|------------------------------------------|
//! | `<text>`                    | CHAT to the selected client              |
//! | `/cmd <name> [json]`        | COMMAND with optional JSON params        |
//! | `/connect [url]`            | Connect (configured URL by default)      |
//! | `/disconnect`               | Close the connection                     |
//! | `/status`                   | Connection snapshot as JSON              |
//! | `/clients`                  | List known clients                       |
//! | `/select <id>` / `/select`  | Select a client / clear the selection    |
//! | `/rename <id> <name>`       | Rename a client                          |
//! | `/remove <id>`              | Forget a client and its history          |
//! | `/history [more]`           | Show the conversation, or page older     |
//! | `/clear`                    | Clear the current conversation           |
//! | `/templates`                | List templates                           |
//! | `/template <id>`            | Send a template                          |
//! | `/save <name> <content>`    | Save a template                          |
//! | `/traffic [search]`         | Show the traffic log                     |
//! | `/pause`, `/resume`         | Pause or resume traffic capture          |
//! | `/test [url]`               | Connection test                          |
//! | `/quit`                     | Exit                                     |

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use relay_console::connection::probe::{test_connection, DEFAULT_TEST_TIMEOUT};
use relay_console::notify::LogNotifier;
use relay_console::store::{JsonFileStore, MemoryStore, Store, Template};
use relay_console::traffic::TrafficFilter;
use relay_console::util::truncate_str;
use relay_console::{Config, Console};

/// Operator console for browser extensions behind a relay server.
#[derive(Parser)]
#[command(name = "relay-console", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive console (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Test whether a relay URL accepts WebSocket connections.
    Probe {
        url: String,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Probe { url, timeout }) => {
            init_tracing("warn");
            run_probe(&url, timeout.map_or(DEFAULT_TEST_TIMEOUT, Duration::from_secs)).await
        }
        Some(Commands::Run { config }) => run_console(config.as_deref()).await,
        None => run_console(None).await,
    }
}

fn init_tracing(default_level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_probe(url: &str, timeout: Duration) -> ExitCode {
    let result = test_connection(url, timeout).await;
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{}", result.message),
    }
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// The store the console uses, plus the file store when there is one so
/// shutdown can wait for its last write.
async fn open_store(config: &Config) -> (Arc<dyn Store>, Option<Arc<JsonFileStore>>) {
    if !config.storage.persist {
        return (Arc::new(MemoryStore::new()), None);
    }
    let path = config.storage.resolved_path();
    match JsonFileStore::open(&path).await {
        Ok(store) => {
            info!("Store: {path}");
            let store = Arc::new(store);
            (Arc::clone(&store) as Arc<dyn Store>, Some(store))
        }
        Err(e) => {
            warn!("Failed to open store at {path}: {e}; history will not be kept");
            (Arc::new(MemoryStore::new()), None)
        }
    }
}

async fn run_console(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("relay-console: {e}");
            return ExitCode::from(2);
        }
    };

    init_tracing(&config.logging.level);
    info!("relay-console v{} starting", env!("CARGO_PKG_VERSION"));

    let (store, file_store) = open_store(&config).await;
    let console = Arc::new(Console::new(&config, store, Arc::new(LogNotifier)));

    if config.server.auto_connect {
        if let Err(e) = console.connect(None).await {
            warn!("Auto-connect to {} failed: {e}", config.server.url);
        }
    }

    // Periodic sweep: time out requests that never got an answer
    let sweeper = Arc::clone(&console);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let expired = sweeper.expire_stale();
            if expired > 0 {
                info!(expired, "Requests timed out");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Flow::Quit = handle_line(&console, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            },
        }
    }

    info!("Shutting down...");
    sweep_task.abort();
    console.dispose();
    if let Some(store) = file_store {
        if let Err(e) = store.flush().await {
            warn!("Failed to save store: {e}");
        }
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Failed to render output: {e}"),
    }
}

async fn handle_line(console: &Console, line: &str) -> Flow {
    if line.is_empty() {
        return Flow::Continue;
    }
    let Some(rest) = line.strip_prefix('/') else {
        if let Err(e) = console.send_chat(line) {
            println!("! {e}");
        }
        return Flow::Continue;
    };

    let (cmd, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();
    match cmd {
        "quit" | "exit" => return Flow::Quit,
        "connect" => {
            let url = (!arg.is_empty()).then_some(arg);
            match console.connect(url).await {
                Ok(()) => println!("connected"),
                Err(e) => println!("! {e}"),
            }
        }
        "disconnect" => console.disconnect(),
        "status" => print_json(&console.snapshot()),
        "clients" => {
            let selected = console.selected_client().map(|c| c.id);
            for c in console.clients() {
                let mark = if selected.as_deref() == Some(c.id.as_str()) { '*' } else { ' ' };
                println!(
                    "{mark} {:<24} {:<12} {}",
                    c.name,
                    c.status.as_str(),
                    c.metadata.current_url.as_deref().unwrap_or("-")
                );
                println!("    {}", c.id);
            }
        }
        "select" => {
            let id = (!arg.is_empty()).then_some(arg);
            if !console.select_client(id) {
                println!("! unknown client `{arg}`");
            }
        }
        "rename" => match arg.split_once(' ') {
            Some((id, name)) if console.rename_client(id, name.trim()) => {}
            _ => println!("! usage: /rename <id> <name>"),
        },
        "remove" => {
            if !console.remove_client(arg) {
                println!("! unknown client `{arg}`");
            }
        }
        "history" => {
            if arg == "more" {
                match console.load_older(None) {
                    Ok(n) => println!("loaded {n} older messages"),
                    Err(e) => println!("! {e}"),
                }
            }
            for m in console.messages(None) {
                let status = m.status.map_or("", |s| s.as_str());
                println!(
                    "[{}] {:?} {status}: {}",
                    m.timestamp.format("%H:%M:%S"),
                    m.sender,
                    m.content
                );
            }
        }
        "clear" => console.clear_conversation(None),
        "cmd" => {
            let (name, params) = arg.split_once(' ').unwrap_or((arg, ""));
            let params = match params.trim() {
                "" => None,
                raw => match serde_json::from_str(raw) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        println!("! params must be JSON: {e}");
                        return Flow::Continue;
                    }
                },
            };
            if let Err(e) = console.send_command(name, params) {
                println!("! {e}");
            }
        }
        "templates" => match console.templates() {
            Ok(list) => {
                for t in list {
                    println!("{}  {} ({} uses)  {}", t.id, t.name, t.usage_count, truncate_str(&t.content, 60));
                }
            }
            Err(e) => println!("! {e}"),
        },
        "template" => {
            if let Err(e) = console.use_template(arg) {
                println!("! {e}");
            }
        }
        "save" => match arg.split_once(' ') {
            Some((name, content)) if !content.trim().is_empty() => {
                let t = Template::new(name, content.trim());
                match console.save_template(&t) {
                    Ok(()) => println!("saved template {}", t.id),
                    Err(e) => println!("! {e}"),
                }
            }
            _ => println!("! usage: /save <name> <content>"),
        },
        "traffic" => {
            let filter = TrafficFilter {
                search: (!arg.is_empty()).then(|| arg.to_string()),
                ..TrafficFilter::default()
            };
            for e in console.traffic(&filter) {
                println!(
                    "{:>5} {} {:?} {:<11} {}",
                    e.id,
                    e.timestamp.format("%H:%M:%S%.3f"),
                    e.direction,
                    e.message_type.as_str(),
                    e.summary
                );
            }
        }
        "pause" => console.traffic_log().set_paused(true),
        "resume" => console.traffic_log().set_paused(false),
        "test" => {
            let url = if arg.is_empty() {
                console.snapshot().url.unwrap_or_default()
            } else {
                arg.to_string()
            };
            print_json(&test_connection(&url, DEFAULT_TEST_TIMEOUT).await);
        }
        "help" => println!("{HELP}"),
        other => println!("! unknown command /{other} (try /help)"),
    }
    Flow::Continue
}

const HELP: &str = "\
<text>                  chat with the selected client
/cmd <name> [json]      send a command
/connect [url]          connect to the relay
/disconnect             close the connection
/status                 connection snapshot
/clients                list clients
/select [id]            select a client (no id clears)
/rename <id> <name>     rename a client
/remove <id>            forget a client
/history [more]         show conversation, or load older messages
/clear                  clear the conversation
/templates              list templates
/template <id>          send a template
/save <name> <content>  save a template
/traffic [search]       show traffic
/pause | /resume        pause or resume traffic capture
/test [url]             connection test
/quit                   exit";
