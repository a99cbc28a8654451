use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::*;
use docsync::crdt::{on_sync, ReplicatedDocument, SyncState};
use docsync::sync::{attach_provider, Endpoint, WebsocketTransport};
use docsync::{logging, SyncConfig};
use std::path::PathBuf;
use std::sync::Arc;
use yrs::sync::Awareness;
use yrs::{Doc, Map, Transact};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "Keep a tree of replicated documents connected to a sync server", version)]
#[command(after_help = "Every loaded sub-document gets its own channel, named
<parent-channel>--<sub-document-guid>. Connection state is printed per document.

Environment:
   DOCSYNC_URL, DOCSYNC_ROOM, DOCSYNC_LOG override the config file.
   RUST_LOG overrides the log filter.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect a root document (and optional sub-documents) and report sync state
    Connect {
        /// Websocket server, e.g. ws://localhost:1234
        #[arg(short, long)]
        url: Option<String>,

        /// Channel of the root document
        #[arg(short, long)]
        room: Option<String>,

        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Create a named sub-document under the root (repeatable)
        #[arg(long = "subdoc", value_name = "NAME")]
        subdocs: Vec<String>,

        /// Also write logs to a daily-rolling file in this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Print the channel names derived for nested sub-documents
    Rooms {
        /// Root channel
        room: String,

        /// Sub-document guids, outermost first
        guids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Connect {
            url,
            room,
            config,
            subdocs,
            log_dir,
        } => {
            let mut settings = match config {
                Some(path) => {
                    let mut settings = SyncConfig::load(&path)?;
                    settings.apply_env_overrides();
                    settings
                }
                None => SyncConfig::from_env(),
            };
            if let Some(url) = url {
                settings.url = url;
            }
            if let Some(room) = room {
                settings.room = room;
            }
            settings.validate()?;

            let _log_guard = match log_dir {
                Some(dir) => Some(logging::init_with_file(&dir, &settings.log_filter)?),
                None => {
                    logging::init(&settings.log_filter)?;
                    None
                }
            };

            connect(settings, subdocs).await?;
        }

        Commands::Rooms { room, guids } => {
            let mut endpoint = Endpoint::new("", room);
            println!("{}", endpoint.room.bright_white());
            for guid in guids {
                endpoint = endpoint.child(&guid);
                println!("{} {}", "→".bright_blue(), endpoint.room.bright_white());
            }
        }
    }

    Ok(())
}

async fn connect(settings: SyncConfig, subdocs: Vec<String>) -> Result<()> {
    let user = whoami::username();
    println!(
        "{} Connecting {} to {} as {}",
        "🌐".cyan(),
        settings.room.bright_yellow(),
        settings.url.bright_blue(),
        user.bright_white()
    );

    let transport = Arc::new(WebsocketTransport::new(settings.reconnect.clone())?);
    let doc = Doc::new();
    report_sync(&doc, settings.room.clone());

    // one awareness for the whole tree, announced on every channel
    let presence = Awareness::new(doc.clone());
    presence
        .set_local_state(serde_json::json!({ "user": user }))
        .map_err(|e| anyhow!("cannot set local presence: {e}"))?;
    let presence = Arc::new(presence);

    let root = attach_provider(
        transport,
        settings.url.clone(),
        settings.room.clone(),
        doc.clone(),
        presence,
    )?;

    if !subdocs.is_empty() {
        let folder = doc.get_or_insert_map("subdocs");
        let mut txn = doc.transact_mut();
        for name in &subdocs {
            let subdoc = folder.insert(&mut txn, name.as_str(), Doc::new());
            report_sync(&subdoc, format!("{}/{}", settings.room, name));
        }
    }

    for room in root.child_rooms() {
        println!("{} Attached {}", "↔".bright_blue(), room.bright_white());
    }

    tokio::signal::ctrl_c().await?;
    root.dispose();
    println!("{}", "✓ Disconnected".green());
    Ok(())
}

fn report_sync(doc: &Doc, label: String) {
    on_sync(&doc.events(), move |state| match state {
        SyncState::Synced => println!("{} {} synced", "✓".green(), label.bright_white()),
        SyncState::NotSynced => {
            println!("{} {} not synced", "⚠️".bright_yellow(), label.bright_white())
        }
    });
}
