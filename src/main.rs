use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

use learnsync::autosave::{DraftStore, SqliteDraftStore};
use learnsync::config::Config;
use learnsync::courses::CourseClient;
use learnsync::query::QueryState;
use learnsync::{demo, logging};

#[derive(Parser, Debug)]
#[command(name = "learnsync")]
#[command(about = "Optimistic mutation and autosave engine for the course editor")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/learnsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log to stderr at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the rollback, pricing, reorder, autosave and conflict scenarios in memory
  Demo,
  /// List admin courses from the configured API
  Courses {
    /// Only courses with this status (draft, published, archived)
    #[arg(long)]
    status: Option<String>,

    /// Only courses whose title contains this text
    #[arg(long)]
    search: Option<String>,
  },
  /// Inspect locally kept editor drafts
  Drafts {
    #[command(subcommand)]
    action: DraftsAction,
  },
}

#[derive(Subcommand, Debug)]
enum DraftsAction {
  /// List drafts, newest first
  List,
  /// Delete every draft
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.log, args.verbose)?;

  match args.command {
    Command::Demo => {
      let report = demo::run(&config).await?;
      report.print();
    }
    Command::Courses { status, search } => {
      let filters: BTreeMap<String, String> = [("status", status), ("search", search)]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect();
      let client = CourseClient::http(&config)?;
      let mut list = client.admin_courses(filters);
      list.fetch();
      match list.settled().await {
        QueryState::Success(courses) => {
          if courses.is_empty() {
            println!("No courses");
          }
          for course in courses {
            let price = if course.pricing.is_free {
              "free".to_string()
            } else {
              format!("{:.2}", course.pricing.price_cents as f64 / 100.0)
            };
            println!("{}\t{}\t{}\t{}", course.id, course.status, price, course.title);
          }
        }
        QueryState::Error { message, .. } => {
          return Err(eyre!("Failed to list courses: {}", message));
        }
        QueryState::Idle | QueryState::Loading => {}
      }
    }
    Command::Drafts { action } => {
      let store = SqliteDraftStore::open_default()?;
      match action {
        DraftsAction::List => {
          let drafts = store.list_drafts()?;
          if drafts.is_empty() {
            println!("No drafts");
          }
          for draft in drafts {
            println!(
              "{}\trev {}\t{}\t{}",
              draft.entity_id,
              draft.base_revision,
              draft.reason.as_str(),
              draft.saved_at.format("%Y-%m-%d %H:%M:%S")
            );
          }
        }
        DraftsAction::Clear => {
          let removed = store.clear()?;
          println!("Removed {} draft(s)", removed);
        }
      }
    }
  }

  Ok(())
}
