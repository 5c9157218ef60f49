//! chatlink: keeps connections to the configured IRC servers alive and
//! takes commands on stdin.
//!
//! Servers come from `~/.config/chatlink/config.toml`. Connections that were
//! up at exit are restored on the next start.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use chatlink_core::autoconnect::TomlAutoconnectStore;
use chatlink_core::config::config_path;
use chatlink_core::prefs::{FixedNetwork, SharedSettings};
use chatlink_core::session::NoMessageLog;
use chatlink_core::{
    Config, Connection, ConnectionDeps, ConnectionRegistry, MessageSink, MessageSinkProvider, PreferenceGatedPolicy,
    RegistryListener, TokioScheduler,
};
use chatlink_irc::{IrcSessionFactory, SqliteMessageSink, SqliteSinkProvider};

use commands::{Command, HELP};

/// How long `/quit` waits for servers to acknowledge before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Messages shown by `/history`.
const HISTORY_LINES: usize = 20;

#[derive(Parser)]
#[command(name = "chatlink", about = "Multi-server IRC connection manager")]
struct Args {
    /// Config file (default: ~/.config/chatlink/config.toml)
    #[arg(long, env = "CHATLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Connect to this server on startup (name or id). Repeatable.
    #[arg(long = "connect")]
    connect: Vec<String>,

    /// Don't restore connections that were up at last exit
    #[arg(long)]
    no_autoconnect: bool,

    /// Don't write message logs
    #[arg(long)]
    no_log: bool,
}

/// Prints connection changes to stdout.
struct StatusPrinter;

impl RegistryListener for StatusPrinter {
    fn connection_info_changed(&self, connection: &Connection) {
        let snapshot = connection.snapshot();
        println!("[{}] {:?}", snapshot.name, snapshot.status);
    }

    fn channel_list_changed(&self, connection: &Connection, channels: &[String]) {
        println!("[{}] channels: {}", connection.name(), channels.join(" "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "chatlink=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let path = args.config.clone().unwrap_or_else(config_path);
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(path = %path.display(), servers = config.servers.len(), "Loaded config");

    let settings = Arc::new(SharedSettings::new(config.settings.clone()));
    let network = Arc::new(FixedNetwork(config.settings.network));
    let policy = PreferenceGatedPolicy::new(config.settings.backoff_schedule(), settings.clone(), network.clone());
    let scheduler = Arc::new(TokioScheduler::current());
    let logs = (!args.no_log).then(SqliteSinkProvider::default);
    let sinks: Arc<dyn MessageSinkProvider> = match &logs {
        Some(logs) => Arc::new(logs.clone()),
        None => Arc::new(NoMessageLog),
    };
    let deps = ConnectionDeps {
        sessions: Arc::new(IrcSessionFactory),
        sinks,
        scheduler: scheduler.clone(),
        policy: Arc::new(policy),
        prefs: settings,
        network,
        client_version: format!("chatlink {}", env!("CARGO_PKG_VERSION")),
    };

    let store = Arc::new(TomlAutoconnectStore::new(path.with_file_name("autoconnect.toml")));
    let registry = ConnectionRegistry::new(deps, store);
    registry.subscribe(Arc::new(StatusPrinter));

    // Restore first so saved connections start with their saved channels.
    if !args.no_autoconnect {
        match registry.restore_autoconnect(&config.servers) {
            Ok(started) if started > 0 => println!("Restoring {started} connection(s)"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read autoconnect list"),
        }
    }
    for server in &config.servers {
        if registry.get(server.id).is_none() {
            registry.add(server.clone(), Vec::new())?;
        }
    }
    for name in &args.connect {
        let connection = find(&registry, name)?;
        connection.connect()?;
    }
    if config.servers.is_empty() {
        println!("No servers configured; add [[servers]] entries to {}", path.display());
    }

    run(&registry, logs.as_ref()).await;

    if let Err(e) = registry.shutdown() {
        tracing::warn!(error = %e, "Failed to save autoconnect list");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, registry.wait_all_disconnected())
        .await
        .is_err()
    {
        tracing::warn!("Some connections did not close in time");
    }
    scheduler.shutdown();
    Ok(())
}

/// Read commands until `/quit`, end of input or ctrl-c.
async fn run(registry: &Arc<ConnectionRegistry>, logs: Option<&SqliteSinkProvider>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        return;
                    }
                };
                match commands::parse(&line) {
                    Ok(Some(Command::Quit)) => return,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(registry, logs, command).await {
                            println!("error: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{msg}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                return;
            }
        }
    }
}

async fn execute(registry: &ConnectionRegistry, logs: Option<&SqliteSinkProvider>, command: Command) -> Result<()> {
    match command {
        Command::Connect(name) => find(registry, &name)?.connect()?,
        Command::Disconnect(name) => find(registry, &name)?.disconnect(),
        Command::Join { server, channel } => {
            let connection = find(registry, &server)?;
            if !connection.is_connected() {
                return Err(anyhow!("{} is not connected", connection.name()));
            }
            let session = connection.session().context("no session")?;
            session.join_channels(vec![channel]).await?;
        }
        Command::Msg { server, target, text } => {
            find(registry, &server)?.send_message(&target, &text).await?;
        }
        Command::History { server, target } => {
            let connection = find(registry, &server)?;
            let logs = logs.context("message logging is off (--no-log)")?;
            let path = logs.path_for(connection.id());
            if !path.exists() {
                println!("[{}] nothing logged yet", connection.name());
                return Ok(());
            }
            // A second handle next to the live sink; WAL mode allows it.
            let log = SqliteMessageSink::open(&path)?;
            let recent = log.recent(&target, HISTORY_LINES);
            log.close();
            for m in recent? {
                let when = chrono::DateTime::from_timestamp_millis(m.timestamp_ms)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let marker = if m.notice { "-" } else { "<" };
                let close = if m.notice { "-" } else { ">" };
                println!("{when} {marker}{}{close} {}", m.from, m.text);
            }
        }
        Command::List => {
            for connection in registry.connections() {
                let s = connection.snapshot();
                println!(
                    "{:<16} {:<14} {:<28} nick={} channels={}",
                    s.name,
                    format!("{:?}", s.status),
                    s.server,
                    s.nick.as_deref().unwrap_or("-"),
                    s.channels.join(",")
                );
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn find(registry: &ConnectionRegistry, name: &str) -> Result<Arc<Connection>> {
    registry
        .find_by_name(name)
        .or_else(|| name.parse().ok().and_then(|id| registry.get(id)))
        .ok_or_else(|| anyhow!("no server named {name}"))
}
