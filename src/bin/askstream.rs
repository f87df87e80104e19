use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use askstream::api::ApiClient;
use askstream::config::Config;
use askstream::observability::init_tracing;
use askstream::pipeline::write_frames;
use askstream::session::{ChatRequest, ConversationPipeline, InMemorySessionStore, TurnSettings};

#[derive(Debug, Parser)]
#[command(name = "askstream", version, about = "Stream one assistant turn as server-sent events")]
struct Cli {
    /// The user message for this turn.
    message: String,
    #[arg(long, default_value = "local-user")]
    user: String,
    #[arg(long, default_value = "local-session")]
    session: String,
    #[arg(long)]
    channel: Option<String>,
    /// Plain text completion instead of the assessment turn.
    #[arg(long)]
    text: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load()?;
    config.validate()?;

    let client = ApiClient::new(&config).context("failed to build API client")?;
    let pipeline = ConversationPipeline::new(
        Arc::new(client),
        Arc::new(InMemorySessionStore::new()),
        TurnSettings::from(&config),
    );

    let mut request = ChatRequest::new(cli.user, cli.session, cli.message);
    if let Some(channel) = cli.channel {
        request = request.with_channel(channel);
    }

    // The stream blocks on its relay, so this runs outside any async runtime.
    let stream = if cli.text {
        pipeline.respond_text(request)?
    } else {
        pipeline.respond(request)?
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let frames = write_frames(&mut out, stream.frames()).context("failed to write frames")?;
    out.flush()?;
    tracing::info!(frames, "turn finished");
    Ok(())
}
