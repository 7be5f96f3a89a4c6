use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use forkchat::{
    ChannelEvent, ChannelState, ContentKind, ConversationEngine, ConversationKind,
    CredentialStore, EngineConfig, FileConfig, FileCredentials, ForkchatConfig, HistoryApi,
    HistoryLoader, Message, ServerConfig, StateChange, StaticCredentials, View, WsConnector,
    load_config,
};

type Engine = ConversationEngine<HistoryLoader, WsConnector>;

/// Everything a subcommand needs, resolved from config, flags, and the
/// token file.
pub struct CliContext {
    server: ServerConfig,
    engine: EngineConfig,
    credentials: Arc<dyn CredentialStore>,
}

impl CliContext {
    pub fn load(
        config: &ForkchatConfig,
        server_override: Option<&str>,
        token: Option<String>,
    ) -> Result<Self> {
        let mut fc: FileConfig = load_config(&config.data_dir).extract().with_context(|| {
            format!("Invalid configuration in {}", config.config_toml_path().display())
        })?;
        if let Some(url) = server_override {
            fc.server.base_url = url.to_string();
        }

        let credentials: Arc<dyn CredentialStore> = match token {
            Some(token) => Arc::new(StaticCredentials::new(token)),
            None => Arc::new(FileCredentials::new(config.token_path())),
        };

        let server = ServerConfig::from_file(&fc.server);
        debug!(api = %server.api_base, ws = %server.ws_base, "resolved backend");
        Ok(Self {
            server,
            engine: EngineConfig::from_file(&fc),
            credentials,
        })
    }

    fn loader(&self) -> Result<HistoryLoader> {
        HistoryLoader::new(&self.server, self.credentials.clone())
    }

    fn engine(&self) -> Result<Engine> {
        Ok(ConversationEngine::new(
            self.loader()?,
            Arc::new(WsConnector),
            self.credentials.clone(),
            self.server.clone(),
            self.engine.clone(),
        ))
    }
}

pub async fn list_command(ctx: &CliContext, json: bool) -> Result<()> {
    let conversations = ctx.loader()?.list_conversations().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
    } else if conversations.is_empty() {
        println!("No conversations.");
    } else {
        println!("{:<38} {:<8} {:<20} {}", "ID", "KIND", "CREATED", "NAME");
        println!("{}", "-".repeat(90));
        for convo in &conversations {
            let created = convo
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!(
                "{:<38} {:<8} {:<20} {}",
                convo.id,
                convo.kind.as_str(),
                created,
                convo.name
            );
        }
        println!("\n{} conversation(s)", conversations.len());
    }

    Ok(())
}

pub async fn new_command(ctx: &CliContext, name: &str, kind: ConversationKind) -> Result<()> {
    let convo = ctx.loader()?.create_conversation(name, kind).await?;
    println!("{}", convo.id);
    Ok(())
}

pub async fn search_command(ctx: &CliContext, conversation_id: &str, query: &str) -> Result<()> {
    let results = ctx.loader()?.search(conversation_id, query).await?;
    if results.is_empty() {
        println!("No matches.");
    }
    for message in results.iter().filter(|m| m.is_valid()) {
        print_message(message, &[]);
    }
    Ok(())
}

// =============================================================================
// Interactive session
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Send(&'a str),
    Search(&'a str),
    Clear,
    Branch { message_id: &'a str, name: &'a str },
    Goto(&'a str),
    Branches,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command<'_>, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line));
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (rest, ""),
    };

    match cmd {
        "search" => Ok(Command::Search(arg)),
        "clear" => Ok(Command::Clear),
        "branch" => match arg.split_once(char::is_whitespace) {
            Some((message_id, name)) => Ok(Command::Branch {
                message_id,
                name: name.trim(),
            }),
            None => Err("usage: /branch <message-id> <name>".to_string()),
        },
        "goto" if !arg.is_empty() => Ok(Command::Goto(arg)),
        "goto" => Err("usage: /goto <branch-id>".to_string()),
        "branches" => Ok(Command::Branches),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command /{other}, try /help")),
    }
}

const HELP: &str = "\
  <text>                      send a message
  /search <query>             show matching messages
  /clear                      back to the live view
  /branch <message-id> <name> fork at a message
  /goto <branch-id>           open a branch
  /branches                   list branches of this conversation
  /quit                       leave";

enum Input {
    Line(std::io::Result<Option<String>>),
    Event(Option<ChannelEvent>),
    Change(Result<StateChange, RecvError>),
}

/// Open a conversation and follow it until EOF or `/quit`.
pub async fn open_command(ctx: &CliContext, conversation_id: &str) -> Result<()> {
    let mut engine = ctx.engine()?;
    let mut changes = engine.subscribe();
    engine.open(conversation_id).await?;
    print_conversation(&engine);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut live = true;

    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line),
            event = engine.next_channel_event(), if live => Input::Event(event),
            change = changes.recv() => Input::Change(change),
        };

        match input {
            Input::Line(line) => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(cmd) => run_command(&mut engine, cmd).await,
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            Input::Event(Some(event)) => engine.handle_channel_event(event),
            Input::Event(None) => {
                warn!("push channel ended");
                live = false;
            }
            Input::Change(Ok(change)) => render_change(&engine, change),
            Input::Change(Err(RecvError::Lagged(n))) => {
                debug!(skipped = n, "display fell behind, redrawing");
                print_conversation(&engine);
            }
            Input::Change(Err(RecvError::Closed)) => break,
        }
    }

    engine.close().await;
    Ok(())
}

/// Failures are recorded as the engine's last error and shown through
/// `ErrorChanged`, so results are only inspected for the success output.
async fn run_command(engine: &mut Engine, cmd: Command<'_>) {
    match cmd {
        Command::Send(content) => {
            let _ = engine.send_message(content, ContentKind::Text).await;
        }
        Command::Search(query) => {
            if engine.search(query).await.is_ok() {
                if let Some(View::Search { query, results }) = engine.view() {
                    println!("-- {} result(s) for \"{}\" (/clear to go back) --", results.len(), query);
                    for message in results {
                        print_message(message, &[]);
                    }
                }
            }
        }
        Command::Clear => engine.clear_search(),
        Command::Branch { message_id, name } => {
            if let Ok(branch) = engine.create_branch(message_id, name).await {
                println!("-- branch \"{}\" created: {} (/goto to open) --", branch.name, branch.id);
            }
        }
        Command::Goto(branch_id) => {
            if engine.navigate_to_branch(branch_id).await.is_ok() {
                print_conversation(engine);
            }
        }
        Command::Branches => {
            let Some(graph) = engine.branches() else {
                return;
            };
            if graph.is_empty() {
                println!("-- no branches --");
            }
            for branch in graph.iter() {
                println!(
                    "  {}  {}  (from message {})",
                    branch.id, branch.name, branch.parent_message_id
                );
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

fn render_change(engine: &Engine, change: StateChange) {
    match change {
        StateChange::MessageAppended { message_id } => {
            if engine.view() != Some(&View::Live) {
                return;
            }
            if let Some(message) = engine.messages().iter().find(|m| m.id == message_id) {
                print_message(message, &engine.branch_links(&message.id));
            }
        }
        StateChange::ViewChanged if engine.view() == Some(&View::Live) => {
            print_conversation(engine);
        }
        StateChange::ChannelStateChanged(ChannelState::Open) => eprintln!("[live]"),
        StateChange::ChannelStateChanged(ChannelState::ReconnectWait) => {
            eprintln!("[connection lost, reconnecting]")
        }
        StateChange::ErrorChanged => {
            if let Some(err) = engine.last_error() {
                eprintln!("[{err}]");
            }
        }
        _ => {}
    }
}

fn print_conversation(engine: &Engine) {
    if let Some(convo) = engine.conversation() {
        println!("== {} ({}) ==", convo.name, convo.id);
    }
    for message in engine.visible_messages() {
        print_message(message, &engine.branch_links(&message.id));
    }
}

fn print_message(message: &Message, links: &[forkchat::BranchLink]) {
    println!("[{}]", message.id);
    if let Some(q) = message.question.as_deref().filter(|q| !q.is_empty()) {
        println!("  > {q}");
    }
    if let Some(r) = message.response.as_deref().filter(|r| !r.is_empty()) {
        for line in r.lines() {
            println!("    {line}");
        }
    }
    for link in links {
        println!("  -> branch {} ({})", link.name, link.id);
    }
}
