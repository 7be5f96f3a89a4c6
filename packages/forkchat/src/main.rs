use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;

use forkchat::{ConversationKind, ForkchatConfig};

#[derive(Parser)]
#[command(name = "forkchat")]
#[command(about = "Terminal client for branching chat conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.forkchat)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backend base URL, overriding config.toml
    #[arg(long, global = true)]
    server: Option<String>,

    /// Bearer token, overriding the token file
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations
    List(ListArgs),

    /// Create a conversation
    New(NewArgs),

    /// Open a conversation and follow it live
    Open(OpenArgs),

    /// Search a conversation's messages
    Search(SearchArgs),
}

#[derive(Parser)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct NewArgs {
    name: String,

    /// direct, group, or branch
    #[arg(long, default_value = "direct")]
    kind: ConversationKind,
}

#[derive(Parser)]
struct OpenArgs {
    /// Conversation id
    conversation: String,
}

#[derive(Parser)]
struct SearchArgs {
    /// Conversation id
    conversation: String,
    query: String,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "forkchat=debug,info"
    } else {
        "forkchat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = ForkchatConfig::new(cli.data_dir.clone())?;
    let ctx = cli::CliContext::load(&config, cli.server.as_deref(), cli.token.clone())?;

    match cli.command {
        Commands::List(args) => cli::list_command(&ctx, args.json).await,
        Commands::New(args) => cli::new_command(&ctx, &args.name, args.kind).await,
        Commands::Open(args) => cli::open_command(&ctx, &args.conversation).await,
        Commands::Search(args) => cli::search_command(&ctx, &args.conversation, &args.query).await,
    }
}
