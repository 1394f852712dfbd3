//! Taskbridge CLI
//!
//! Runs the IPC server with a replaying task host, drives it as a client, or
//! parses a saved assistant message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use taskbridge_protocol::{TaskCommand, TaskEvent};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use taskbridge_ipc::assistant_message::{AssistantMessageParser, ToolVocabulary};
use taskbridge_ipc::client::{ClientEvent, DisconnectReason, IpcClient, install_signal_handlers};
use taskbridge_ipc::config::{IpcClientConfig, ServerConfig};
use taskbridge_ipc::relay::CommandRelay;
use taskbridge_ipc::replay::{self, ReplayHost};
use taskbridge_ipc::server::{IpcServer, shutdown_signal};
use taskbridge_ipc::structured_logging::{Component, init_component_tracing};
use taskbridge_ipc::StdoutHandle;

#[derive(Parser)]
#[command(name = "taskbridge")]
#[command(about = "Task IPC bridge between an editor host and its controllers")]
struct Args {
    /// Enable development logging to the default log file
    #[arg(long, global = true)]
    dev_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve task commands, replaying each task's text as the model response
    Server {
        /// Socket to listen on (default: /tmp/taskbridge-ipc.sock)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Replay this file for every task instead of the task text
        #[arg(long)]
        response: Option<PathBuf>,

        /// Characters per simulated stream chunk
        #[arg(long, default_value_t = replay::DEFAULT_CHUNK_CHARS)]
        chunk_chars: usize,
    },

    /// Connect to a server, send one command and print task events as JSON lines
    Client {
        /// Socket to connect to (default: $TASKBRIDGE_IPC_SOCKET_PATH, then /tmp/taskbridge-ipc.sock)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Seconds to wait for the handshake
        #[arg(long, default_value = "10")]
        ready_timeout: u64,

        /// Stop after this many seconds without a task event
        #[arg(long, default_value = "5")]
        idle_timeout: u64,

        #[command(subcommand)]
        action: ClientAction,
    },

    /// Parse an assistant message (from FILE or stdin) and print its blocks as JSON
    Parse {
        file: Option<PathBuf>,

        /// Feed the parser in chunks of this many characters
        #[arg(long)]
        chunk_chars: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum ClientAction {
    /// Start a new task
    Start { text: String },
    /// Cancel a running task
    Cancel { task_id: String },
    /// Resume a task
    Resume { task_id: String },
    /// Answer the task waiting on the user
    Message { text: String },
}

impl ClientAction {
    fn into_command(self) -> TaskCommand {
        match self {
            ClientAction::Start { text } => TaskCommand::StartNewTask {
                text,
                images: vec![],
                configuration: None,
                new_tab: false,
            },
            ClientAction::Cancel { task_id } => TaskCommand::CancelTask { task_id },
            ClientAction::Resume { task_id } => TaskCommand::ResumeTask { task_id },
            ClientAction::Message { text } => TaskCommand::SendMessage {
                text: Some(text),
                images: vec![],
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let component = match &args.command {
        Command::Server { .. } => Component::Server,
        Command::Client { .. } => Component::Client,
        Command::Parse { .. } => Component::Parser,
    };

    // Dropping the guard flushes any buffered dev log lines.
    let flush_guard = init_component_tracing(component, args.dev_log)?;

    match args.command {
        Command::Server {
            socket,
            response,
            chunk_chars,
        } => {
            let config = socket.map(ServerConfig::new).unwrap_or_default();
            run_server(config, response, chunk_chars).await?;
        }
        Command::Client {
            socket,
            ready_timeout,
            idle_timeout,
            action,
        } => {
            let config = match socket {
                Some(socket) => IpcClientConfig::new(socket),
                None => IpcClientConfig::from_env().unwrap_or_default(),
            };
            run_client(
                config,
                action.into_command(),
                Duration::from_secs(ready_timeout),
                Duration::from_secs(idle_timeout),
            )
            .await?;
        }
        Command::Parse { file, chunk_chars } => {
            run_parse(file, chunk_chars).await?;
        }
    }

    drop(flush_guard);
    Ok(())
}

async fn run_server(
    config: ServerConfig,
    response: Option<PathBuf>,
    chunk_chars: usize,
) -> Result<()> {
    let (server, handle, events) = IpcServer::bind(&config)
        .with_context(|| format!("starting server on {}", config.socket_path().display()))?;

    let mut host = ReplayHost::new(handle.clone()).with_chunk_chars(chunk_chars);
    if let Some(path) = response {
        let script = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading response file {}", path.display()))?;
        host = host.with_script(script);
    }

    let relay = CommandRelay::new(Arc::new(host), handle);
    let relay_task = tokio::spawn(relay.run(events));

    info!("Server listening on {}", server.socket_path().display());
    server.run(shutdown_signal()).await?;

    relay_task.abort();
    info!("Server stopped");
    Ok(())
}

async fn run_client(
    config: IpcClientConfig,
    command: TaskCommand,
    ready_timeout: Duration,
    idle_timeout: Duration,
) -> Result<()> {
    config.validate()?;
    let client = IpcClient::new(config);
    install_signal_handlers(client.clone()).context("installing signal handlers")?;

    let mut events = client.subscribe();
    let result = async {
        let client_id = client
            .wait_until_ready(ready_timeout)
            .await
            .context("connecting to server")?;
        info!("Connected as {}, sending {}", client_id, command.name());
        client.send_command(command);
        print_events(&client, &mut events, idle_timeout).await
    }
    .await;

    client.shutdown().await;
    result
}

/// Print task events until the task ends, the command is rejected, or the
/// server goes quiet for `idle_timeout`.
async fn print_events(
    client: &IpcClient,
    events: &mut broadcast::Receiver<ClientEvent>,
    idle_timeout: Duration,
) -> Result<()> {
    let stdout = StdoutHandle::spawn();
    let result = forward_events(client, events, idle_timeout, &stdout).await;
    stdout.shutdown().await;
    result
}

async fn forward_events(
    client: &IpcClient,
    events: &mut broadcast::Receiver<ClientEvent>,
    idle_timeout: Duration,
    stdout: &StdoutHandle,
) -> Result<()> {
    loop {
        let event = match tokio::time::timeout(idle_timeout, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!("Skipped {} events", skipped);
                continue;
            }
            Ok(Err(RecvError::Closed)) => return Ok(()),
            Err(_) => {
                if client.session().terminated {
                    bail!("client session ended");
                }
                info!("No task events for {:?}, exiting", idle_timeout);
                return Ok(());
            }
        };

        match event {
            ClientEvent::TaskEvent(event) => {
                let done = matches!(
                    event,
                    TaskEvent::TaskCompleted { .. }
                        | TaskEvent::TaskAborted { .. }
                        | TaskEvent::CommandRejected { .. }
                );
                stdout.print(event).await;
                if done {
                    return Ok(());
                }
            }
            ClientEvent::Disconnect {
                reason: DisconnectReason::RetriesExhausted,
            } => bail!("lost connection to server and gave up reconnecting"),
            ClientEvent::Disconnect { .. } => warn!("Connection lost, reconnecting"),
            ClientEvent::Connect | ClientEvent::Ack(_) => {}
        }
    }
}

async fn run_parse(file: Option<PathBuf>, chunk_chars: Option<usize>) -> Result<()> {
    let text = match &file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading stdin")?;
            text
        }
    };

    let mut parser = AssistantMessageParser::new(ToolVocabulary::default());
    match chunk_chars {
        Some(chunk_chars) => {
            for chunk in replay::chunk_text(&text, chunk_chars) {
                parser.update(&chunk);
            }
        }
        None => {
            parser.update(&text);
        }
    }
    let blocks = parser.finish();

    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}
