use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConfiguredProfile, MailConfig};
use crate::email::{
    ComposeRequest, EmailCoordinator, EmailError, EmailResult, Folder, Identity, IdentityKey,
    MessageSigner, OfflineTransport, ProfileService, Thread, ThreadId,
};

/// Stationmail - station-relayed email threads from the command line
#[derive(Parser, Debug)]
#[command(name = "stationmail")]
#[command(about = "Inspect and manage station-relayed email threads")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration directory path
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Data directory path (overrides the configuration file)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the threads of a folder (inbox, sent, outbox, drafts, archive, spam, trash, failed)
    List {
        folder: Folder,

        /// Only threads carrying this label
        #[arg(long)]
        label: Option<String>,
    },

    /// Show one thread with its messages
    Show { id: String },

    /// List known labels
    Labels,

    /// Label management
    Label(LabelArgs),

    /// Move a thread to the archive
    Archive { id: String },

    /// Move a thread back to the inbox
    Restore { id: String },

    /// Mark a thread as spam
    Spam { id: String },

    /// Move a thread to the trash
    Trash { id: String },

    /// Permanently erase a thread from the trash
    Purge { id: String },

    /// Queue a failed thread for another delivery attempt
    Retry { id: String },

    /// Save a draft
    Draft(DraftArgs),

    /// Run one outbox pass
    Outbox,
}

#[derive(Args, Debug)]
pub struct LabelArgs {
    #[command(subcommand)]
    pub action: LabelAction,
}

#[derive(Subcommand, Debug)]
pub enum LabelAction {
    /// Register a new label
    Create { name: String },
    /// Remove a label from every thread and forget it
    Delete { name: String },
    /// Tag a thread
    Add { id: String, name: String },
    /// Untag a thread
    Remove { id: String, name: String },
}

#[derive(Args, Debug)]
pub struct DraftArgs {
    /// Recipient callsigns or addresses
    #[arg(long)]
    pub to: Vec<String>,

    #[arg(long)]
    pub cc: Vec<String>,

    #[arg(long, default_value = "")]
    pub subject: String,

    #[arg(long, default_value = "")]
    pub body: String,
}

/// Signer for a CLI without key material; only unsigned paths work
struct NoKeySigner;

impl MessageSigner for NoKeySigner {
    fn sign(&self, _canonical: &[u8], _key: &IdentityKey) -> EmailResult<String> {
        Err(EmailError::signing("no signing backend available"))
    }
}

/// Command-line interface handler
pub struct CliHandler {
    coordinator: Arc<EmailCoordinator>,
    identity: Identity,
    station: String,
}

impl CliHandler {
    /// Open the thread store described by the configuration
    pub async fn new(config: MailConfig, data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => config.resolve_data_dir()?,
        };

        let coordinator = EmailCoordinator::open(
            config.coordinator_settings(data_dir.clone()),
            Arc::new(OfflineTransport),
            Arc::new(NoKeySigner),
        )
        .await
        .with_context(|| format!("Cannot open thread store at {}", data_dir.display()))?;

        let profile = ConfiguredProfile(config.identity.clone()).profile();
        Ok(Self {
            coordinator: Arc::new(coordinator),
            identity: Identity::from_profile(profile, None),
            station: config.identity.station,
        })
    }

    /// Handle CLI commands
    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::List { folder, label } => self.handle_list(folder, label).await,
            Commands::Show { id } => self.handle_show(&id).await,
            Commands::Labels => {
                for label in self.coordinator.get_labels().await {
                    println!("{}", label);
                }
                Ok(())
            }
            Commands::Label(args) => self.handle_label(args.action).await,
            Commands::Archive { id } => self.report_move(self.coordinator.archive_thread(&thread_id(&id)).await),
            Commands::Restore { id } => self.report_move(self.coordinator.restore_thread(&thread_id(&id)).await),
            Commands::Spam { id } => self.report_move(self.coordinator.mark_as_spam(&thread_id(&id)).await),
            Commands::Trash { id } => self.report_move(self.coordinator.delete_thread(&thread_id(&id)).await),
            Commands::Retry { id } => self.report_move(self.coordinator.mark_as_pending(&thread_id(&id)).await),
            Commands::Purge { id } => {
                self.coordinator.permanently_delete(&thread_id(&id)).await?;
                println!("Erased {}", id);
                Ok(())
            }
            Commands::Draft(args) => self.handle_draft(args).await,
            Commands::Outbox => {
                let report = self.coordinator.process_outbox().await;
                println!(
                    "accepted {}, delayed {}, failed {}, skipped {}, errors {}",
                    report.accepted, report.delayed, report.failed, report.skipped, report.errors
                );
                Ok(())
            }
        }
    }

    async fn handle_list(&self, folder: Folder, label: Option<String>) -> Result<()> {
        let threads = self.coordinator.get_folder(folder).await;
        let threads: Vec<Thread> = match label {
            Some(label) => threads
                .into_iter()
                .filter(|thread| thread.labels.contains(label.trim()))
                .collect(),
            None => threads,
        };

        if threads.is_empty() {
            println!("No threads in {}", folder);
            return Ok(());
        }
        for thread in threads {
            println!("{}", summary_line(&thread));
        }
        Ok(())
    }

    async fn handle_show(&self, id: &str) -> Result<()> {
        let thread = self.coordinator.get_thread(&thread_id(id)).await?;
        println!("Thread:   {}", thread.id());
        println!("Status:   {}", thread.status());
        println!("Station:  {}", thread.station);
        println!("From:     {}", thread.from);
        println!("To:       {}", thread.to.join(", "));
        if !thread.cc.is_empty() {
            println!("Cc:       {}", thread.cc.join(", "));
        }
        println!("Subject:  {}", thread.subject);
        if !thread.labels.is_empty() {
            let labels: Vec<&str> = thread.labels.iter().map(String::as_str).collect();
            println!("Labels:   {}", labels.join(", "));
        }

        for message in thread.messages() {
            println!();
            let signed = if message.is_signed() { "signed" } else { "unsigned" };
            println!(
                "--- {} at {} ({})",
                message.author(),
                message.timestamp().format("%Y-%m-%d %H:%M"),
                signed
            );
            println!("{}", message.content());
            if let Some(attachments) = message.attachments() {
                for name in attachments.names() {
                    println!("[attachment] {}", name);
                }
            }
        }
        Ok(())
    }

    async fn handle_label(&self, action: LabelAction) -> Result<()> {
        match action {
            LabelAction::Create { name } => {
                if self.coordinator.create_label(&name).await? {
                    println!("Created label {}", name.trim());
                } else {
                    println!("Label {} already exists", name.trim());
                }
            }
            LabelAction::Delete { name } => {
                let untagged = self.coordinator.delete_label(&name).await?;
                println!("Deleted label {} ({} threads untagged)", name.trim(), untagged);
            }
            LabelAction::Add { id, name } => {
                self.coordinator.add_label(&thread_id(&id), &name).await?;
                println!("Tagged {} with {}", id, name.trim());
            }
            LabelAction::Remove { id, name } => {
                match self.coordinator.remove_label(&thread_id(&id), &name).await? {
                    Some(_) => println!("Removed {} from {}", name.trim(), id),
                    None => println!("{} does not carry {}", id, name.trim()),
                }
            }
        }
        Ok(())
    }

    async fn handle_draft(&self, args: DraftArgs) -> Result<()> {
        let request = ComposeRequest {
            station: self.station.clone(),
            to: args.to,
            cc: args.cc,
            subject: args.subject,
            content: args.body,
            ..ComposeRequest::default()
        };
        let draft = self.coordinator.save_draft(&self.identity, &request).await?;
        println!("Saved draft {}", draft.thread.id());
        Ok(())
    }

    fn report_move(&self, result: EmailResult<Thread>) -> Result<()> {
        let thread = result?;
        println!("{} is now {}", thread.id(), thread.status());
        Ok(())
    }
}

fn thread_id(raw: &str) -> ThreadId {
    ThreadId::from_string(raw.trim())
}

fn summary_line(thread: &Thread) -> String {
    let labels = if thread.labels.is_empty() {
        String::new()
    } else {
        let labels: Vec<&str> = thread.labels.iter().map(String::as_str).collect();
        format!(" [{}]", labels.join(","))
    };
    format!(
        "{}  {}  {:<20}  {}{}",
        thread.id(),
        thread.created.format("%Y-%m-%d %H:%M"),
        thread.from,
        thread.subject,
        labels
    )
}
