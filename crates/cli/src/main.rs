use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taskchat::config;
use taskchat::controller::{ChatEvent, SessionController};
use taskchat::history::RestHistoryClient;
use taskchat::message::{ChatMessage, TaskId, UserId};
use taskchat::store::{MessageStore, RenderableMessage};
use taskchat::transport::TransportState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "taskchat")]
#[command(about = "Task chat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Chat with the counterpart of a task (interactive). Type /quit to leave, /retry to reload
    /// history, /status to dump the session as JSON.
    Chat {
        /// Config file path (default: TASKCHAT_CONFIG_PATH or ~/.taskchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Task whose conversation to open.
        #[arg(long, short)]
        task: TaskId,

        /// User id of the other party. Without it messages can be read but not sent.
        #[arg(long, value_name = "ID")]
        counterpart: Option<UserId>,

        /// Display name of the other party.
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the stored messages of a task.
    History {
        /// Config file path (default: TASKCHAT_CONFIG_PATH or ~/.taskchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        task: TaskId,
    },

    /// Print every message between you and another user, across tasks.
    Conversation {
        /// Config file path (default: TASKCHAT_CONFIG_PATH or ~/.taskchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// The other user's id.
        #[arg(long = "with", value_name = "ID")]
        with: UserId,
    },

    /// Run the development relay (REST history + STOMP topics, in memory).
    Relay {
        /// Config file path (default: TASKCHAT_CONFIG_PATH or ~/.taskchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP and WebSocket port (default from config or 8085)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("taskchat {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Chat {
            config,
            task,
            counterpart,
            name,
        }) => run_chat(config, task, counterpart, name).await,
        Some(Commands::History { config, task }) => run_history(config, task).await,
        Some(Commands::Conversation { config, with }) => run_conversation(config, with).await,
        Some(Commands::Relay { config, port }) => run_relay(config, port).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_message(m: &RenderableMessage) {
    println!("[{}] {}: {}", m.time_label, m.display_name, m.body);
}

async fn run_chat(
    config_path: Option<PathBuf>,
    task: TaskId,
    counterpart: Option<UserId>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let controller = Arc::new(SessionController::from_config(&config)?);
    let events = controller.subscribe_events();
    controller.open_session(task, counterpart, name).await;

    let printer = tokio::spawn(print_events(controller.clone(), events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/quit") || input.eq_ignore_ascii_case("/exit") {
            break;
        }
        if input.eq_ignore_ascii_case("/retry") {
            if !controller.retry_history().await {
                eprintln!("history is not in a failed state");
            }
            continue;
        }
        if input.eq_ignore_ascii_case("/status") {
            let snapshot = controller.snapshot().await;
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("! cannot encode status: {}", e),
            }
            continue;
        }
        if let Err(e) = controller.send_message(input).await {
            eprintln!("! {}", e);
        }
    }

    controller.close_session().await;
    printer.abort();
    Ok(())
}

/// Print banners and new messages as the controller reports them.
async fn print_events(controller: Arc<SessionController>, mut events: broadcast::Receiver<ChatEvent>) {
    let mut printed = 0usize;
    loop {
        let event = match events.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("chat printer lagged {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ChatEvent::StateChanged { state, .. } => match state {
                TransportState::Connecting => eprintln!("* connecting..."),
                TransportState::Connected => eprintln!("* connected"),
                TransportState::Reconnecting => eprintln!("* connection lost, retrying"),
                TransportState::Disconnected => eprintln!("* disconnected"),
            },
            ChatEvent::ConnectFailed { attempt, error, .. } => {
                eprintln!("* connect attempt {} failed: {}", attempt, error);
            }
            ChatEvent::HistoryFailed { error, .. } => {
                eprintln!("* could not load history: {} (type /retry)", error);
            }
            ChatEvent::HistoryLoaded { count, .. } => {
                let list = controller.display_list().await;
                if count == 0 && list.is_empty() {
                    eprintln!("* no messages yet");
                } else {
                    eprintln!("--- {} earlier message(s) ---", count);
                }
                after_history(&list, count, printed).for_each(print_message);
                printed = list.len();
            }
            ChatEvent::MessagesChanged { .. } => {
                let list = controller.display_list().await;
                if list.len() < printed {
                    printed = 0;
                }
                list[printed..].iter().for_each(print_message);
                printed = list.len();
            }
            ChatEvent::SessionClosed { .. } => break,
        }
    }
}

/// Lines to print once history is merged in front of `printed` live lines already shown:
/// the history rows, then live lines that arrived since.
fn after_history(
    list: &[RenderableMessage],
    history_count: usize,
    printed: usize,
) -> impl Iterator<Item = &RenderableMessage> {
    let history_len = history_count.min(list.len());
    let (history, live) = list.split_at(history_len);
    let shown = printed.min(live.len());
    history.iter().chain(live[shown..].iter())
}

fn history_client(config: &config::Config) -> RestHistoryClient {
    RestHistoryClient::new(
        &config.server.api_base,
        config::resolve_token(config),
        config.chat.connect_timeout(),
    )
}

fn print_rows(local_user_id: UserId, rows: Vec<ChatMessage>) {
    if rows.is_empty() {
        println!("no messages");
        return;
    }
    let mut store = MessageStore::new(local_user_id, None);
    store.seed(rows);
    store
        .to_display_list(chrono::Utc::now())
        .for_each(|m| print_message(&m));
}

async fn run_history(config_path: Option<PathBuf>, task: TaskId) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let rows = history_client(&config).task_history(task).await?;
    print_rows(config::resolve_user_id(&config).unwrap_or_default(), rows);
    Ok(())
}

async fn run_conversation(config_path: Option<PathBuf>, with: UserId) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let me = config::resolve_user_id(&config).ok_or_else(|| {
        anyhow::anyhow!("local user id not configured (identity.userId or TASKCHAT_USER_ID)")
    })?;
    let rows = history_client(&config).fetch_conversation(me, with).await?;
    print_rows(me, rows);
    Ok(())
}

async fn run_relay(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, _) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.relay.port = p;
    }
    log::info!("starting relay on {}:{}", config.relay.bind, config.relay.port);
    taskchat::relay::run_relay(config).await
}
