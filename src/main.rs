use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use futures_util::{pin_mut, StreamExt};
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use llama_chat_dialogue::chat::{NoExtensions, ScriptedEngine};
use llama_chat_dialogue::{log_info, CharacterCard, ChatGenerator, ChatState, ReplyKind, Transcript};

/// Preview chat prompts and replay scripted replies through the dialogue core.
#[derive(Parser, Debug)]
#[command(name = "llama_chat_dialogue", version)]
struct Cli {
    /// Chat state JSON file. Defaults apply to missing fields.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Character card (JSON, or YAML by `.yml`/`.yaml` extension) applied on
    /// top of the chat state.
    #[arg(long)]
    character: Option<PathBuf>,

    /// Saved chat: a `{"data", "data_visible"}` document or plain dialogue.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Extend the newest reply instead of answering a new message.
    #[arg(long = "continue", conflicts_with = "regenerate")]
    continue_last: bool,

    /// Answer the newest message again.
    #[arg(long)]
    regenerate: bool,

    /// Draft the user's next message.
    #[arg(long)]
    impersonate: bool,

    /// Print prompt rows as JSON instead of the prompt.
    #[arg(long)]
    rows: bool,

    /// Scripted engine fragment (repeatable). Replays a generation instead of
    /// printing the prompt.
    #[arg(long = "reply")]
    replies: Vec<String>,

    /// New user message.
    #[arg(default_value = "")]
    input: String,
}

fn setup_logging() -> Result<()> {
    let log_dir = "logs";
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = format!("{log_dir}/{timestamp}.log");

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}")))
        .build(log_path)?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Debug))?;

    log4rs::init_config(config)?;

    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_state(cli: &Cli) -> Result<ChatState> {
    let mut state = match &cli.state {
        Some(path) => ChatState::from_json(&read_file(path)?)
            .with_context(|| format!("loading chat state from {}", path.display()))?,
        None => ChatState::default(),
    };
    if let Some(path) = &cli.character {
        let text = read_file(path)?;
        let card = match path.extension().and_then(|e| e.to_str()) {
            Some("yml" | "yaml") => CharacterCard::from_yaml(&text),
            _ => CharacterCard::from_json(&text),
        }
        .with_context(|| format!("loading character from {}", path.display()))?;
        card.apply_to(&mut state);
        state.validate()?;
    }
    Ok(state)
}

/// Saved history when given, otherwise a fresh chat opened by the greeting.
fn load_transcript(cli: &Cli, state: &ChatState) -> Result<Transcript> {
    let mut transcript = Transcript::new();
    match &cli.history {
        Some(path) => transcript.load_history(&read_file(path)?, &state.name1, &state.name2),
        None => transcript.clear_chat_log(&state.greeting, state.mode, &NoExtensions),
    }
    Ok(transcript)
}

fn reply_kind(cli: &Cli) -> ReplyKind {
    if cli.continue_last {
        ReplyKind::Continue
    } else if cli.regenerate {
        ReplyKind::Regenerate
    } else {
        ReplyKind::Generate
    }
}

fn print_prompt(cli: &Cli, generator: &ChatGenerator, state: &ChatState, transcript: &Transcript) -> Result<()> {
    let prompt = if cli.impersonate {
        generator.impersonation_prompt(state, transcript, cli.rows)?
    } else {
        generator.chat_prompt(&cli.input, state, transcript, reply_kind(cli), cli.rows)?
    };

    match prompt.rows {
        Some(rows) if cli.rows => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => println!("{}", prompt.prompt),
    }
    Ok(())
}

async fn replay(cli: &Cli, generator: &ChatGenerator, state: &ChatState, mut transcript: Transcript) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));

    if cli.impersonate {
        let drafts = generator.impersonate_reply(&cli.input, state, &transcript, cancel);
        pin_mut!(drafts);
        let mut draft = String::new();
        while let Some(item) = drafts.next().await {
            draft = item?;
        }
        println!("{draft}");
        return Ok(());
    }

    {
        let snapshots = generator.generate_chat_reply(&cli.input, state, &mut transcript, reply_kind(cli), cancel);
        pin_mut!(snapshots);
        while let Some(snapshot) = snapshots.next().await {
            snapshot?;
        }
    }
    println!("{}", transcript.to_json()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = setup_logging() {
        eprintln!("Failed to set up logging: {e}");
    }

    let state = load_state(&cli)?;
    let transcript = load_transcript(&cli, &state)?;
    log_info!("Loaded {} turns in {:?} mode", transcript.len(), state.mode);

    let generator = ChatGenerator::with_engine(Arc::new(ScriptedEngine::new(vec![cli.replies.clone()])));
    if cli.replies.is_empty() {
        print_prompt(&cli, &generator, &state, &transcript)
    } else {
        replay(&cli, &generator, &state, transcript).await
    }
}
