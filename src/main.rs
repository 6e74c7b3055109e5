mod app;
mod cache;
mod config;
mod db;
mod error;
mod feed;
mod models;
mod schedule;

use chrono::Utc;

use app::App;
use config::Config;
use error::{AppError, Result};
use models::{NewComic, UpdateSchedule};

const USAGE: &str = "\
Usage: comic-reader <command> [options]

Commands:
  add --title T --base URL [--ord N] [--first URL] [--latest URL]
      [--rss URL] [--updates SuMTuWThFSa] [--nsfw]
  list                       Active comics with their schedule and unread items
  today [--json]             Comics due today, then the rest
  read <comic-id>            Mark a comic read and open it in the browser
  refresh [comic-id]         Pull new items from RSS feeds
  mark-all <comic-id> read|unread";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging (config level unless RUST_LOG says otherwise)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let app = App::new(&config).await?;
    let result = run(&app, command, &args[1..]).await;
    if let Err(e) = &result {
        if e.is_storage() {
            tracing::error!(db_path = %config.db_path, "Storage failure: {}", e);
        }
    }

    // Flush pending read events even if the command failed
    let stats = app.shutdown().await?;
    tracing::debug!(?stats, "Read-event worker stopped");

    result
}

async fn run(app: &App, command: &str, args: &[String]) -> Result<()> {
    match command {
        "add" => {
            let (comic, ordinal) = parse_add_args(args)?;
            let title = comic.title.clone();
            let id = app.add_comic(comic, ordinal).await?;
            println!("Added {} as comic {}", title, id);
        }

        "list" => {
            let now = Utc::now();
            let unread = app.unread_counts().await?;
            for comic in app.list().await? {
                let count = unread
                    .iter()
                    .find(|u| u.comic_id == comic.id)
                    .map(|u| u.unread)
                    .unwrap_or(0);
                println!("{:>4} {} {} [{} unread]", comic.id, comic.summary_line(now), comic.title, count);
            }
        }

        "today" => {
            let report = app.due_report(Utc::now()).await?;
            if args.iter().any(|a| a == "--json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let now = Utc::now();
                println!("Today:");
                for comic in &report.today {
                    println!("{:>4} {} {}", comic.id, comic.title, comic.summary_line(now));
                }
                println!("\nThe rest:");
                for comic in &report.the_rest {
                    println!("{:>4} {} {}", comic.id, comic.title, comic.summary_line(now));
                }
            }
        }

        "read" => {
            let comic_id = parse_id(args.first())?;
            match app.read(comic_id).await? {
                Some(comic) => {
                    println!("Reading {} at {}", comic.title, comic.base_url);
                    if let Err(e) = open::that(&comic.base_url) {
                        tracing::warn!("Failed to open browser: {}", e);
                    }
                }
                None => println!("No comic with id {}", comic_id),
            }
        }

        "refresh" => {
            let comic_id = args.first().map(|a| parse_id(Some(a))).transpose()?;
            let summaries = app.refresh_feeds(comic_id).await?;
            for summary in &summaries {
                print!("{}: {} new, {} unread", summary.title, summary.new, summary.unread);
                if let Some(latest) = &summary.latest {
                    print!(" (latest: {})", latest.title);
                }
                println!();
            }
            println!("Refreshed {} feeds", summaries.len());
        }

        "mark-all" => {
            let comic_id = parse_id(args.first())?;
            let is_read = match args.get(1).map(String::as_str) {
                Some("read") => true,
                Some("unread") => false,
                _ => return Err(AppError::validation("mark-all needs 'read' or 'unread'")),
            };
            let changed = app.mark_all(comic_id, is_read).await?;
            println!("Updated {} feed items", changed);
        }

        _ => {
            println!("{}", USAGE);
        }
    }

    Ok(())
}

fn parse_id(arg: Option<&String>) -> Result<i64> {
    let arg = arg.ok_or_else(|| AppError::validation("missing comic id"))?;
    arg.parse::<i64>()
        .map_err(|_| AppError::validation(format!("invalid comic id '{}'", arg)))
}

fn parse_add_args(args: &[String]) -> Result<(NewComic, Option<i64>)> {
    let mut comic = NewComic::new(0, "", "", 0);
    let mut ordinal = None;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        if flag == "--nsfw" {
            comic.nsfw = true;
            continue;
        }
        let value = iter
            .next()
            .ok_or_else(|| AppError::validation(format!("{} needs a value", flag)))?
            .clone();
        match flag.as_str() {
            "--title" => comic.title = value,
            "--base" => comic.base_url = value,
            "--first" => comic.first_comic_url = Some(value),
            "--latest" => comic.latest_comic_url = Some(value),
            "--rss" => comic.rss_url = Some(value),
            "--updates" => comic.schedule = UpdateSchedule::parse(&value)?,
            "--ord" => {
                ordinal = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| AppError::validation(format!("invalid ordinal '{}'", value)))?,
                )
            }
            other => return Err(AppError::validation(format!("unknown option {}", other))),
        }
    }

    Ok((comic, ordinal))
}
