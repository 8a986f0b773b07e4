use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use docdesk::cache::{CacheResult, CacheSource};
use docdesk::config::Config;
use docdesk::logging;
use docdesk::mutation::{ChannelNotifier, Level, MutationIntent, Notification};
use docdesk::portal::{mutations, CachedPortal, Document, DocumentFilter, Role};

#[derive(Parser, Debug)]
#[command(name = "docdesk")]
#[command(about = "Browse and manage portal documents from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/docdesk/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also print log output to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List documents
  Documents {
    #[arg(long)]
    folder: Option<String>,
    #[arg(long)]
    search: Option<String>,
    /// Only favorites
    #[arg(long)]
    favorites: bool,
  },
  /// Show one document with its versions
  Show { id: String },
  /// Delete a document
  Delete { id: String },
  /// Toggle the favorite flag
  Favorite { id: String },
  /// Make an earlier version current
  Restore { id: String, version: u32 },
  /// Re-run processing of a document
  Refresh {
    id: String,
    /// Poll until processing finishes
    #[arg(long)]
    wait: bool,
  },
  /// List who has access to a document
  Permissions { document_id: String },
  /// Give someone access to a document
  Grant {
    document_id: String,
    principal_id: String,
    #[arg(long, default_value = "viewer")]
    role: Role,
  },
  /// Change the role of an existing permission
  SetRole { permission_id: String, role: Role },
  /// Remove a permission
  Revoke { permission_id: String },
  /// Search the employee directory
  Employees {
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    search: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _logging = logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let (notifier, notifications) = ChannelNotifier::new();
  let portal = CachedPortal::new(&config, Arc::new(notifier))?;

  run(&portal, args.command, notifications).await
}

async fn run(
  portal: &CachedPortal,
  command: Command,
  mut notifications: UnboundedReceiver<Notification>,
) -> Result<()> {
  match command {
    Command::Documents {
      folder,
      search,
      favorites,
    } => {
      let filter = DocumentFilter {
        folder,
        search,
        favorites_only: favorites,
      };
      let result = portal.documents(filter).await?;
      report_source(&result);
      for doc in &result.data {
        print_document_row(doc);
      }
    }
    Command::Show { id } => {
      let result = portal.document(&id).await?;
      report_source(&result);
      print_document(&result.data);
    }
    Command::Delete { id } => {
      mutate(portal, mutations::delete_document(&id), &mut notifications).await?;
    }
    Command::Favorite { id } => {
      portal.document(&id).await?;
      mutate(portal, mutations::toggle_favorite(&id), &mut notifications).await?;
    }
    Command::Restore { id, version } => {
      // The local version check needs the document in the cache
      portal.document(&id).await?;
      mutate(
        portal,
        mutations::restore_version(&id, version),
        &mut notifications,
      )
      .await?;
    }
    Command::Refresh { id, wait } => {
      mutate(portal, mutations::refresh_status(&id), &mut notifications).await?;
      if wait {
        let handle = portal.watch_status(&id);
        match handle.join().await {
          Some(status) => println!("{}: {}", id, status),
          None => return Err(eyre!("Stopped polling {} before processing finished", id)),
        }
      }
    }
    Command::Permissions { document_id } => {
      let result = portal.permissions(&document_id).await?;
      report_source(&result);
      for p in &result.data {
        println!("{:<12} {:<16} {}", p.id, p.principal_id, p.role);
      }
    }
    Command::Grant {
      document_id,
      principal_id,
      role,
    } => {
      mutate(
        portal,
        mutations::grant_permission(&document_id, &principal_id, role),
        &mut notifications,
      )
      .await?;
    }
    Command::SetRole {
      permission_id,
      role,
    } => {
      mutate(
        portal,
        mutations::update_permission_role(&permission_id, role),
        &mut notifications,
      )
      .await?;
    }
    Command::Revoke { permission_id } => {
      mutate(
        portal,
        mutations::revoke_permission(&permission_id),
        &mut notifications,
      )
      .await?;
    }
    Command::Employees { department, search } => {
      let result = portal.employees(department, search).await?;
      report_source(&result);
      for e in &result.data {
        println!(
          "{:<10} {:<28} {:<32} {}",
          e.id,
          e.name,
          e.email,
          e.department.as_deref().unwrap_or("-")
        );
      }
    }
  }

  Ok(())
}

/// Run a write and print what the coordinator reported.
async fn mutate(
  portal: &CachedPortal,
  intent: MutationIntent,
  notifications: &mut UnboundedReceiver<Notification>,
) -> Result<()> {
  let outcome = portal.mutate(intent).await;

  let mut failure = None;
  while let Ok(notification) = notifications.try_recv() {
    match notification.level {
      Level::Success => println!("{}", notification.message),
      Level::Error => {
        failure = Some(match notification.detail {
          Some(detail) => format!("{}: {}", notification.message, detail),
          None => notification.message,
        })
      }
    }
  }

  if outcome.is_success() {
    return Ok(());
  }
  Err(eyre!(failure.unwrap_or_else(|| "Request failed".to_string())))
}

fn report_source<T>(result: &CacheResult<T>) {
  if result.source == CacheSource::Offline {
    let when = result
      .cached_at
      .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
      .unwrap_or_default();
    eprintln!("(offline, showing data cached {})", when);
  }
}

fn print_document_row(doc: &Document) {
  println!(
    "{:<10} {} {:<40} {:<12} v{}",
    doc.id,
    if doc.is_favorite { "*" } else { " " },
    doc.title,
    doc.status.to_string(),
    doc.current_version
  );
}

fn print_document(doc: &Document) {
  println!("{} {}", doc.id, doc.title);
  println!("  owner:    {}", doc.owner_id);
  if let Some(folder) = &doc.folder {
    println!("  folder:   {}", folder);
  }
  println!("  status:   {}", doc.status);
  println!("  favorite: {}", if doc.is_favorite { "yes" } else { "no" });
  println!("  updated:  {}", doc.updated_at);
  for v in &doc.versions {
    let marker = if v.number == doc.current_version { "*" } else { " " };
    println!(
      "  {} v{:<4} {} {}",
      marker,
      v.number,
      v.created_at,
      v.author_id.as_deref().unwrap_or("")
    );
  }
}
