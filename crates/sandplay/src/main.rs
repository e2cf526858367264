//! # sandplay
//!
//! Loads a guest into a fresh context, answers its API calls from a fixture
//! file and prints every rendered frame as one JSON line on stdout.

mod fixtures;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use sandbus::ContextId;
use sandbus::FileSourceStore;
use sandbus::MessageBus;
use sandbus::RenderedFrame;
use sandbus::SourceStore;
use sandrun::Interaction;

use crate::fixtures::FixtureResolver;

#[derive(Parser, Debug)]
#[command(name = "sandplay", version, about = "Run a sandboxed guest and print the frames it renders")]
struct Args {
    /// Guest module, WebAssembly text or binary. Text sources are saved for the next run.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Directory the last source is kept in.
    #[arg(long, env = "SANDPLAY_STATE_DIR", default_value = ".sandplay")]
    state_dir: PathBuf,

    /// JSON object mapping "METHOD url" to a response body.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Interaction fired after loading, as `frame-title:element:event`. Repeatable.
    #[arg(long)]
    interact: Vec<InteractArg>,

    /// How long to keep printing frames after the last interaction.
    #[arg(long, default_value_t = 500)]
    wait_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
struct InteractArg {
    title: String,
    element: String,
    event: String,
}

impl FromStr for InteractArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the title may itself contain ':'
        let mut parts = s.rsplitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(event), Some(element), Some(title))
                if !event.is_empty() && !element.is_empty() && !title.is_empty() =>
            {
                Ok(Self {
                    title: title.to_string(),
                    element: element.to_string(),
                    event: event.to_string(),
                })
            }
            _ => Err(format!("expected frame-title:element:event, got '{}'", s)),
        }
    }
}

fn read_source(args: &Args, store: &dyn SourceStore) -> anyhow::Result<Vec<u8>> {
    let Some(path) = &args.source else {
        let saved = store.load()?.context("no --source given and no saved source")?;
        tracing::info!("resuming saved source");
        return Ok(saved.into_bytes());
    };

    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    match std::str::from_utf8(&bytes) {
        Ok(text) => store.save(text)?,
        Err(_) => tracing::warn!(path = %path.display(), "binary module, not saved"),
    }
    Ok(bytes)
}

async fn find_frame(bus: &MessageBus, id: ContextId, title: &str, wait: Duration) -> Option<RenderedFrame> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let found = bus.rendered_frames(id).into_iter().find(|frame| frame.title == title);
        if found.is_some() || tokio::time::Instant::now() >= deadline {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = FileSourceStore::new(&args.state_dir);
    let source = read_source(&args, &store)?;

    let resolver = match &args.fixtures {
        Some(path) => FixtureResolver::from_file(path)?,
        None => FixtureResolver::default(),
    };
    tracing::info!(fixtures = resolver.len(), "resolver ready");

    let bus = MessageBus::builder().resolver(Arc::new(resolver)).build()?;
    let _printer = bus.on_frame_rendered(|frame| match serde_json::to_string(frame) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "unprintable frame"),
    });

    let id = bus.create_context();
    bus.load(id, &source).await?;

    let wait = Duration::from_millis(args.wait_ms);
    for target in &args.interact {
        let frame = find_frame(&bus, id, &target.title, wait)
            .await
            .with_context(|| format!("no frame titled '{}'", target.title))?;
        let interaction = Interaction {
            element_id: target.element.clone(),
            event_name: target.event.clone(),
            detail: Value::Null,
        };
        bus.dispatch_interaction(id, &frame.id, &interaction)?;
    }

    tokio::time::sleep(wait).await;
    bus.release(id);
    Ok(())
}
