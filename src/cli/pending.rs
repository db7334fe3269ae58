//! Pending queue CLI subcommands.
//!
//! Provides commands to:
//! - `list`: Show recordings not yet confirmed by the store
//! - `retry`: Re-upload a failed recording
//! - `compact`: Rewrite the queue log with only the live entries

use anyhow::{Context, Result};
use clap::Subcommand;

use super::{open_queue, record_line, Engine};
use crate::config;
use crate::ingest::UploadOutcome;

/// Pending-queue subcommands
#[derive(Subcommand, Debug)]
pub enum PendingCommands {
    /// List pending debriefs
    List,

    /// Retry a failed upload
    Retry {
        /// Debrief ID
        id: String,
    },

    /// Compact the queue log
    Compact,
}

pub async fn execute(user: Option<String>, command: PendingCommands) -> Result<()> {
    match command {
        PendingCommands::List => list().await,
        PendingCommands::Retry { id } => retry(user, &id).await,
        PendingCommands::Compact => compact().await,
    }
}

async fn list() -> Result<()> {
    let queue = open_queue(config::config()?).await?;
    let entries = queue.entries().await;

    if entries.is_empty() {
        println!("No pending debriefs");
        return Ok(());
    }

    println!("{:<8} {}", "STATE", "DEBRIEF");
    println!("{}", "-".repeat(75));
    for entry in entries {
        let state = if entry.acknowledged {
            "sent"
        } else if entry.record.is_permanently_failed() {
            "failed"
        } else {
            "local"
        };
        println!("{:<8} {}", state, record_line(&entry.record));
        if let Some(error) = &entry.record.error_message {
            println!("{:<8} ! {}", "", error);
        }
    }
    Ok(())
}

async fn retry(user: Option<String>, id: &str) -> Result<()> {
    let engine = Engine::connect(user).await?;
    let outcome = engine
        .uploader()
        .retry_upload(id)
        .await
        .with_context(|| format!("Cannot retry {}", id))?;

    match outcome {
        UploadOutcome::Acknowledged(record) => {
            println!("Uploaded {} ({})", record.id, record.status);
            Ok(())
        }
        UploadOutcome::Failed { error, .. } => {
            anyhow::bail!("Upload failed again: {}", error.user_message())
        }
    }
}

async fn compact() -> Result<()> {
    let queue = open_queue(config::config()?).await?;
    queue.compact().await?;
    println!("Compacted {} pending entr(ies)", queue.len().await);
    Ok(())
}
