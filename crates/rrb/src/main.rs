//! rrb - credit card rewards assistant: chat pipeline and corpus sync.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use rrb_core::{
    cache::PropertyWindowCache,
    compose::{quota_reply, OutboundMessage, ResponseComposer, SimpleCardBuilder},
    config::Config,
    correspondence::CorrespondenceStore,
    domain::SenderId,
    filter::{AiClassifier, ContentFilterChain},
    gateway::{transport::FailoverTransport, AiGateway},
    pipeline::{ChatPipeline, InboundMessage, PipelineReply},
    profile::JsonProfileStore,
    rate_limit::RateLimiter,
    store::JsonFilePropertyStore,
    sync::DocumentSynchronizer,
    utils::JsonlConversationLog,
};
use rrb_drive::DriveFolder;
use rrb_gemini::{FileSearchStore, GeminiClient};

const DEFAULT_SENDER: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "rrb", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read `<sender> <message>` lines from stdin and answer each one.
    Chat,
    /// Answer a single question.
    Ask {
        #[arg(long, default_value = DEFAULT_SENDER)]
        sender: String,
        #[arg(required = true)]
        question: Vec<String>,
    },
    /// Show the remaining quota of a sender.
    Quota {
        #[arg(default_value = DEFAULT_SENDER)]
        sender: String,
    },
    /// Upload new source documents to the file-search store.
    Sync,
    /// Delete every document in the store and reset the name map.
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// List live store documents with their canonical names.
    List,
    /// Delete one store document.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rrb_core::logging::init("rrb")?;
    let cli = Cli::parse();
    let cfg = Config::load()?;

    match cli.command {
        Commands::Chat => chat(&cfg).await,
        Commands::Ask { sender, question } => {
            let pipeline = build_pipeline(&cfg)?;
            let msg = InboundMessage::new(sender, question.join(" "));
            print_reply(&pipeline.handle(&msg).await)
        }
        Commands::Quota { sender } => {
            let d = build_limiter(&cfg)
                .status(&SenderId::new(sender))
                .await?;
            println!("{}", quota_reply(&d));
            Ok(())
        }
        Commands::Sync => {
            let report = build_synchronizer(&cfg, true)?.sync().await?;
            println!(
                "uploaded={} skipped={} unsupported={} failed={} rename_failures={} orphans_removed={}",
                report.uploaded,
                report.skipped,
                report.unsupported,
                report.failed,
                report.rename_failures,
                report.orphans_removed
            );
            Ok(())
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every store document without --yes");
            }
            let report = build_synchronizer(&cfg, false)?.clear_all().await?;
            println!(
                "deleted={} failed={} passes={}",
                report.deleted, report.failed, report.passes
            );
            Ok(())
        }
        Commands::List => {
            for doc in build_synchronizer(&cfg, false)?.inventory().await? {
                println!(
                    "{}\t{}\t{}",
                    doc.id,
                    doc.display_name,
                    doc.canonical_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::Delete { id } => {
            build_synchronizer(&cfg, false)?.delete_document(&id).await?;
            println!("deleted {id}");
            Ok(())
        }
    }
}

async fn chat(cfg: &Config) -> anyhow::Result<()> {
    let pipeline = build_pipeline(cfg)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (sender, text) = match line.split_once(char::is_whitespace) {
            Some((s, t)) => (s, t.trim()),
            None => (DEFAULT_SENDER, line),
        };
        print_reply(&pipeline.handle(&InboundMessage::new(sender, text)).await)?;
    }
    Ok(())
}

fn print_reply(reply: &PipelineReply) -> anyhow::Result<()> {
    for msg in &reply.messages {
        match msg {
            OutboundMessage::Text { text } => println!("{text}"),
            OutboundMessage::Card(card) => println!("{}", serde_json::to_string_pretty(card)?),
        }
    }
    Ok(())
}

fn build_pipeline(cfg: &Config) -> anyhow::Result<ChatPipeline> {
    let endpoint = Arc::new(GeminiClient::new(&cfg.model)?);
    let transport = Arc::new(FailoverTransport::new(
        endpoint,
        cfg.model.free_api_key.clone(),
        cfg.model.paid_api_key.clone(),
    ));
    if !transport.has_key() {
        info!("No model API key configured; answers will fall back to the error reply");
    }

    let classifier = transport
        .has_key()
        .then(|| AiClassifier::new(&cfg.model, transport.clone()));
    let filter = ContentFilterChain::new(&cfg.filter, classifier)?;
    let limiter = build_limiter(cfg);
    let gateway = AiGateway::new(&cfg.model, transport);
    let composer = ResponseComposer::new(Some(Arc::new(SimpleCardBuilder::default())));

    let mut pipeline = ChatPipeline::new(limiter, filter, gateway, composer)
        .with_quota_keywords(cfg.quota_keywords.clone())
        .with_retrieval(cfg.model.retrieval_enabled);

    if let Some(path) = &cfg.storage.profile_store_path {
        let profiles = JsonProfileStore::load(path)
            .with_context(|| format!("loading profiles from {}", path.display()))?;
        info!(profiles = profiles.len(), "Profiles loaded");
        pipeline = pipeline.with_profiles(Arc::new(profiles));
    }
    if let Some(path) = &cfg.storage.conversation_log_path {
        pipeline = pipeline.with_logger(Arc::new(JsonlConversationLog::new(path.clone())));
    }
    Ok(pipeline)
}

/// Windows live in their own file so quota holds across invocations.
fn build_limiter(cfg: &Config) -> RateLimiter {
    let props = Arc::new(JsonFilePropertyStore::new(
        cfg.storage.rate_window_store_path.clone(),
    ));
    RateLimiter::new(&cfg.rate_limit, Arc::new(PropertyWindowCache::new(props)))
}

/// Store administration; `with_source` adds the Drive folder needed by `sync`.
fn build_synchronizer(cfg: &Config, with_source: bool) -> anyhow::Result<DocumentSynchronizer> {
    let Some(api_key) = cfg.model.store_api_key() else {
        bail!("GEMINI_API_KEY or GEMINI_FREE_API_KEY is required for store operations");
    };
    let Some(store_name) = &cfg.model.file_search_store else {
        bail!("FILE_SEARCH_STORE is required for store operations");
    };
    let store = FileSearchStore::new(&cfg.model, api_key, store_name.clone())?;

    let names = CorrespondenceStore::new(Arc::new(JsonFilePropertyStore::new(
        cfg.storage.property_store_path.clone(),
    )));
    let sync = DocumentSynchronizer::new(&cfg.sync, Arc::new(store), names);
    if !with_source {
        return Ok(sync);
    }

    let source = DriveFolder::from_config(&cfg.sync)?
        .context("DRIVE_FOLDER_ID and DRIVE_ACCESS_TOKEN are required for sync")?;
    Ok(sync.with_source(Arc::new(source)))
}
