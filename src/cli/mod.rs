//! Command-line interface for debrief.
//!
//! Provides commands for browsing the timeline, inspecting a single
//! debrief, uploading recordings and managing the pending upload queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::adapters::{
    AddressBook, ApiClient, HttpBlobResolver, HttpKeyProvider, HttpRecordStore,
    HttpUploadEndpoint, JsonAddressBook, RecordStore,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    ContactNameResolver, DetailService, EncryptionGateway, LoadOutcome, PlaybackSource,
    Reconciler, ReconcilerHandle, TimelineSnapshot,
};
use crate::domain::{format_duration, DateRangeOption, DebriefFilters, DebriefRecord};
use crate::ingest::{DebriefUploader, NewRecording, PendingUploadQueue, UploadOutcome};

pub mod pending;

/// debrief - offline-first sync for recorded debriefs
#[derive(Parser, Debug)]
#[command(name = "debrief")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// User to act as (overrides DEBRIEF_USER_ID / config)
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the timeline grouped by day
    Timeline {
        /// Case-insensitive search over name, summary and transcript
        #[arg(short, long)]
        search: Option<String>,

        /// Only debriefs with this contact
        #[arg(short, long)]
        contact: Option<String>,

        /// Date window
        #[arg(short, long, value_enum, default_value = "all")]
        range: RangeArg,

        /// Only debriefs with action items
        #[arg(long)]
        action_items: bool,

        /// Number of pages to load
        #[arg(short, long, default_value = "1")]
        pages: usize,
    },

    /// Show one debrief (decrypted) and where to play its audio
    Show {
        /// Debrief ID
        id: String,

        /// Resolve (and decrypt if needed) the audio
        #[arg(short, long)]
        audio: bool,
    },

    /// Upload a new recording
    Upload {
        /// Audio file
        audio: PathBuf,

        /// Contact ID
        #[arg(short, long)]
        contact: String,

        /// Recording length in seconds
        #[arg(short, long)]
        duration: f64,
    },

    /// Delete a debrief
    Delete {
        /// Debrief ID
        id: String,
    },

    /// Manage the pending upload queue
    Pending {
        #[command(subcommand)]
        command: pending::PendingCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Date window for the CLI (maps to DateRangeOption)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RangeArg {
    Today,
    Week,
    Month,
    All,
}

impl From<RangeArg> for DateRangeOption {
    fn from(r: RangeArg) -> Self {
        match r {
            RangeArg::Today => DateRangeOption::Today,
            RangeArg::Week => DateRangeOption::ThisWeek,
            RangeArg::Month => DateRangeOption::ThisMonth,
            RangeArg::All => DateRangeOption::All,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let user = self.user;
        match self.command {
            Commands::Timeline {
                search,
                contact,
                range,
                action_items,
                pages,
            } => {
                let filters = DebriefFilters {
                    contact_id: contact,
                    date_option: range.into(),
                    has_action_items: action_items.then_some(true),
                    ..Default::default()
                };
                show_timeline(user, filters, search, pages).await
            }
            Commands::Show { id, audio } => show_debrief(user, &id, audio).await,
            Commands::Upload {
                audio,
                contact,
                duration,
            } => upload(user, audio, contact, duration).await,
            Commands::Delete { id } => delete_debrief(user, &id).await,
            Commands::Pending { command } => pending::execute(user, command).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Collaborators wired from the resolved configuration
pub(crate) struct Engine {
    config: &'static ResolvedConfig,
    user_id: String,
    api: ApiClient,
    store: Arc<dyn RecordStore>,
    queue: Arc<PendingUploadQueue>,
    resolver: Arc<ContactNameResolver>,
}

impl Engine {
    pub(crate) async fn connect(user: Option<String>) -> Result<Self> {
        let config = config::config()?;
        let user_id = user
            .or_else(|| config.user_id.clone())
            .context("No user configured (use --user, DEBRIEF_USER_ID or api.user_id)")?;
        let api_url = config
            .api_url
            .as_deref()
            .context("No API URL configured (set DEBRIEF_API_URL or api.url)")?;

        let api = ApiClient::new(api_url, config.api_token.clone(), config.sync.request_timeout())?;
        let store: Arc<dyn RecordStore> = Arc::new(HttpRecordStore::new(
            api.clone(),
            config.sync.subscription_poll(),
        ));
        let queue = Arc::new(open_queue(config).await?);

        let book: Arc<dyn AddressBook> = Arc::new(
            JsonAddressBook::open(&config.contacts_file)
                .await
                .with_context(|| {
                    format!("Failed to load contacts: {}", config.contacts_file.display())
                })?,
        );
        let resolver = Arc::new(ContactNameResolver::new(
            book,
            config.sync.contact_cache_capacity,
        ));

        Ok(Self {
            config,
            user_id,
            api,
            store,
            queue,
            resolver,
        })
    }

    fn reconciler(&self) -> ReconcilerHandle {
        Reconciler::new(self.store.clone(), self.queue.clone(), self.resolver.clone())
            .with_settings(self.config.sync.timeline())
            .spawn()
    }

    fn detail(&self) -> DetailService {
        let blobs = Arc::new(HttpBlobResolver::new(self.api.clone()));
        let keys = Arc::new(HttpKeyProvider::new(self.api.clone()));
        let gateway = Arc::new(EncryptionGateway::new(
            keys,
            blobs.clone(),
            self.config.audio_cache_dir(),
        ));
        DetailService::new(self.store.clone(), blobs, self.resolver.clone(), gateway)
    }

    pub(crate) fn uploader(&self) -> DebriefUploader {
        let endpoint = Arc::new(HttpUploadEndpoint::new(self.api.clone()));
        DebriefUploader::new(self.queue.clone(), endpoint)
    }
}

pub(crate) async fn open_queue(config: &ResolvedConfig) -> Result<PendingUploadQueue> {
    let path = config.pending_queue_path();
    PendingUploadQueue::open(&path)
        .await
        .with_context(|| format!("Failed to open pending queue: {}", path.display()))
}

/// Load the timeline and print it grouped by day
async fn show_timeline(
    user: Option<String>,
    filters: DebriefFilters,
    search: Option<String>,
    pages: usize,
) -> Result<()> {
    let engine = Engine::connect(user).await?;
    let timeline = engine.reconciler();

    let mut outcome = timeline.load_page(&engine.user_id, filters.clone(), true).await?;
    for _ in 1..pages.max(1) {
        if !matches!(outcome, LoadOutcome::Loaded { has_more: true, .. }) {
            break;
        }
        outcome = timeline.load_page(&engine.user_id, filters.clone(), false).await?;
    }
    if let Some(query) = search {
        timeline.search_now(&query).await?;
    }

    let snapshot = timeline.snapshot();
    timeline.shutdown().await?;
    print_timeline(&snapshot);
    Ok(())
}

fn print_timeline(snapshot: &TimelineSnapshot) {
    if snapshot.sections.is_empty() {
        println!("No debriefs found");
        return;
    }

    for section in &snapshot.sections {
        println!("{}", section.title);
        println!("{}", "-".repeat(75));
        for record in &section.records {
            println!("  {}", record_line(record));
        }
        println!();
    }

    if snapshot.pending_count > 0 {
        println!("{} pending upload(s)", snapshot.pending_count);
    }
    if snapshot.has_more {
        println!("More debriefs available (use --pages)");
    }
    if !snapshot.recent_contacts.is_empty() {
        let names: Vec<&str> = snapshot
            .recent_contacts
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        println!("Recent contacts: {}", names.join(", "));
    }
    for warning in &snapshot.warnings {
        eprintln!("warning: {}", warning);
    }
}

pub(crate) fn record_line(record: &DebriefRecord) -> String {
    let when = record.occurred_at.with_timezone(&Local).format("%H:%M");
    let summary: String = record
        .summary
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(40)
        .collect();
    format!(
        "{} {:<20} {:<10} {:>6}  {:<36} {}",
        when,
        record.contact_name,
        record.status,
        format_duration(record.duration_secs),
        record.id,
        summary
    )
}

/// Show a single debrief
async fn show_debrief(user: Option<String>, id: &str, audio: bool) -> Result<()> {
    let engine = Engine::connect(user).await?;
    let detail = engine.detail();
    let opened = detail.open(&engine.user_id, id).await?;
    let record = &opened.record;

    println!("Debrief:  {}", record.id);
    println!("Contact:  {}", record.contact_name);
    println!("When:     {}", record.occurred_at.with_timezone(&Local));
    println!("Duration: {}", format_duration(record.duration_secs));
    println!("Status:   {}", record.status);
    if record.is_retrying() {
        println!("          retry {} scheduled", record.retry_count);
    }
    if let Some(error) = &record.error_message {
        println!("Error:    {}", error);
    }

    if let Some(summary) = &record.summary {
        println!("\nSummary:\n{}", summary);
    }
    if !record.action_items().is_empty() {
        println!("\nAction items:");
        for (i, item) in record.action_items().iter().enumerate() {
            println!("  {}. {}", i + 1, item);
        }
    }
    if let Some(transcript) = &record.transcript {
        println!("\nTranscript:\n{}", transcript);
    }
    for warning in &opened.warnings {
        eprintln!("warning: {}", warning);
    }

    if audio {
        match detail.playback(&engine.user_id, record).await? {
            PlaybackSource::Remote(url) => println!("\nAudio: {}", url),
            PlaybackSource::LocalFile(path) => println!("\nAudio: {}", path.display()),
        }
    }

    Ok(())
}

/// Submit a new recording
async fn upload(user: Option<String>, audio: PathBuf, contact: String, duration: f64) -> Result<()> {
    if !audio.exists() {
        anyhow::bail!("Audio file not found: {}", audio.display());
    }

    let engine = Engine::connect(user).await?;
    let contact_name = engine.resolver.resolve_name(&contact).await;
    let recording = NewRecording {
        user_id: engine.user_id.clone(),
        contact_id: contact,
        contact_name,
        occurred_at: Utc::now(),
        duration_secs: duration,
        audio_path: audio,
        phone_number: None,
        email: None,
    };

    match engine.uploader().submit(recording).await? {
        UploadOutcome::Acknowledged(record) => {
            println!("Uploaded {} ({})", record.id, record.status);
        }
        UploadOutcome::Failed { record, error } => {
            eprintln!("Upload failed: {}", error.user_message());
            eprintln!("Kept as pending; retry with: debrief pending retry {}", record.id);
            std::process::exit(1);
        }
    }
    Ok(())
}

/// Delete a debrief locally and remotely
async fn delete_debrief(user: Option<String>, id: &str) -> Result<()> {
    let engine = Engine::connect(user).await?;
    let timeline = engine.reconciler();

    // The first page tells the reconciler whether the record already failed
    let loaded = timeline
        .load_page(&engine.user_id, DebriefFilters::default(), true)
        .await;
    if let Err(e) = loaded {
        tracing::warn!("Could not load timeline before delete: {}", e);
    }

    let result = timeline.delete(id).await;
    timeline.shutdown().await?;
    result.with_context(|| format!("Failed to delete debrief {}", id))?;

    println!("Deleted {}", id);
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Debrief Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:          {}", cfg.home.display());
    println!("  Pending queue: {}", cfg.pending_queue_path().display());
    println!("  Audio cache:   {}", cfg.audio_cache_dir().display());
    println!("  Contacts:      {}", cfg.contacts_file.display());
    println!();
    println!("API:");
    println!("  URL:   {}", cfg.api_url.as_deref().unwrap_or("(not set)"));
    println!("  User:  {}", cfg.user_id.as_deref().unwrap_or("(not set)"));
    println!(
        "  Token: {}",
        if cfg.api_token.is_some() { "(set)" } else { "(not set)" }
    );
    println!();
    println!("Sync:");
    print!("{}", serde_yaml::to_string(&cfg.sync)?);

    Ok(())
}
