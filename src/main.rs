use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use imagelens_core::commands;
use imagelens_core::core::image::UploadFile;
use imagelens_core::database::models::ImageView;
use imagelens_core::services::ingest::{IngestEvent, UploadId};
use imagelens_core::{AppConfig, AppState};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];

#[derive(Parser, Debug)]
#[command(name = "imagelens", version, about = "Ingest, annotate and search images")]
struct Cli {
    /// Directory holding the database and stored objects
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL stored objects are served from
    #[arg(long, global = true, value_name = "URL")]
    public_url: Option<String>,

    /// Owner whose images are read and written
    #[arg(long, global = true, default_value = "local")]
    owner: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload image files or directories of images
    Upload {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
        /// Print the batch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Derive a thumbnail for an already stored object
    Thumbnail {
        image_path: String,
        thumbnail_path: String,
    },

    /// Annotate an image again
    Annotate {
        image_id: i64,
        /// Stored object to annotate (default: the image's original)
        #[arg(long)]
        path: Option<String>,
    },

    /// Images sharing tags or colors with an image
    Similar { image_id: i64 },

    /// Search annotations
    Search {
        #[command(subcommand)]
        command: SearchCmd,
    },

    /// List images, most recent first
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show one image with its annotation
    Show { image_id: i64 },

    /// Read or set the annotation status of an image
    Status {
        image_id: i64,
        /// pending, processing, completed or failed
        #[arg(long, value_name = "STATUS")]
        set: Option<String>,
    },

    /// Delete an image, its binaries and its annotation
    Delete {
        image_id: i64,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SearchCmd {
    /// Match descriptions and tags, case-insensitively
    Text { query: String },
    /// Match dominant colors near a hex color
    Color { color: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.set_data_dir(dir);
    }
    if let Some(url) = cli.public_url {
        config.public_base_url = url;
    }

    log::debug!(
        "Database {}, objects {}",
        config.database_path.display(),
        config.storage_dir.display()
    );

    let state = AppState::from_config(config).context("Failed to initialize imagelens")?;
    let owner = cli.owner.as_str();

    match cli.command {
        Commands::Upload { paths, json } => {
            let files = collect_uploads(&paths)?;
            if files.is_empty() {
                println!("No images found.");
                return Ok(());
            }
            println!("▶ Uploading {} image(s) as {}", files.len(), owner);

            let (tx, rx) = mpsc::unbounded_channel();
            let bar = ProgressBar::new(files.len() as u64 * 100);
            bar.set_style(
                ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {msg}")?
                    .progress_chars("=>-"),
            );
            let renderer = tokio::spawn(render_progress(rx, bar));

            // Ctrl-C lets the current file finish and skips the rest.
            let cancel = Arc::new(AtomicBool::new(false));
            let interrupt = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::warn!("Interrupted, cancelling remaining uploads");
                        cancel.store(true, Ordering::Relaxed);
                    }
                }
            });

            let report =
                commands::upload_batch(&state, owner, files, Some(tx), Some(cancel)).await?;
            interrupt.abort();
            renderer.await.context("Progress display failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            println!(
                "\n✅ {} completed, {} failed",
                report.completed_count(),
                report.failed_count()
            );
        }

        Commands::Thumbnail {
            image_path,
            thumbnail_path,
        } => {
            let stored = commands::derive_thumbnail(&state, &image_path, &thumbnail_path).await?;
            println!("🖼️  {} → {}", stored.thumbnail_path, stored.thumbnail_url);
        }

        Commands::Annotate { image_id, path } => {
            let path = match path {
                Some(path) => path,
                None => commands::get_image(&state, image_id, owner)?.image.original_path,
            };
            let response = commands::annotate(&state, &path, image_id).await?;
            println!("🏷️  [{}] {}", response.source.as_str(), response.description);
            println!("   tags: {}", response.tags.join(", "));
            println!("   colors: {}", response.colors.join(", "));
        }

        Commands::Similar { image_id } => {
            let views = commands::find_similar(&state, image_id, owner)?;
            print_views(&format!("Images similar to #{}", image_id), &views);
        }

        Commands::Search { command } => match command {
            SearchCmd::Text { query } => {
                let views = commands::search_text(&state, owner, &query)?;
                print_views(&format!("Matches for \"{}\"", query), &views);
            }
            SearchCmd::Color { color } => {
                let views = commands::search_color(&state, owner, &color)?;
                print_views(&format!("Images near {}", color), &views);
            }
        },

        Commands::List { page, limit } => {
            let result = commands::list_images(&state, owner, Some(page), Some(limit))?;
            let p = result.pagination;
            print_views(
                &format!(
                    "Page {}/{} ({} image(s))",
                    p.page,
                    p.total_pages.max(1),
                    p.total
                ),
                &result.images,
            );
        }

        Commands::Show { image_id } => {
            let view = commands::get_image(&state, image_id, owner)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }

        Commands::Status { image_id, set } => match set {
            Some(status) => {
                let annotation =
                    commands::update_processing_status(&state, image_id, owner, &status)?;
                println!("✅ Image #{} is now {}", image_id, annotation.status);
            }
            None => {
                let status = commands::processing_status(&state, image_id, owner)?;
                println!("Image #{}: {}", image_id, status);
            }
        },

        Commands::Delete { image_id, yes } => {
            let confirmed = yes
                || Confirm::new()
                    .with_prompt(format!("Delete image #{} and its files?", image_id))
                    .default(false)
                    .interact()?;
            if !confirmed {
                println!("Nothing deleted.");
                return Ok(());
            }

            let deleted = commands::delete_image(&state, image_id, owner).await?;
            if deleted.binaries_removed {
                println!("🗑️  Deleted image #{}", deleted.image_id);
            } else {
                println!(
                    "🗑️  Deleted image #{} (⚠️  stored files could not be removed)",
                    deleted.image_id
                );
            }
        }
    }

    Ok(())
}

/// Expand directories into the image files below them.
fn collect_uploads(paths: &[PathBuf]) -> Result<Vec<UploadFile>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    files.push(read_upload(entry.path())?);
                }
            }
        } else {
            files.push(read_upload(path)?);
        }
    }
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn read_upload(path: &Path) -> Result<UploadFile> {
    UploadFile::from_path(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<IngestEvent>, bar: ProgressBar) {
    let mut per_file: HashMap<UploadId, u64> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            IngestEvent::Progress { id, progress } => {
                per_file.insert(id, u64::from(progress.progress));
                bar.set_position(per_file.values().sum());
                bar.set_message(format!("{} ({:?})", progress.filename, progress.status));
            }
            IngestEvent::FileCompleted {
                filename,
                image_id,
                source,
                ..
            } => {
                let source = source.map(|s| s.as_str()).unwrap_or("unsaved");
                bar.println(format!("   ✅ {} → #{} ({})", filename, image_id, source));
            }
            IngestEvent::FileFailed {
                id,
                filename,
                message,
            } => {
                // A failed file counts as finished for the overall bar.
                per_file.insert(id, 100);
                bar.set_position(per_file.values().sum());
                bar.println(format!("   ❌ {}: {}", filename, message));
            }
            IngestEvent::BatchFinished { .. } => {
                bar.finish_with_message("Upload complete");
            }
        }
    }
}

fn print_views(title: &str, views: &[ImageView]) {
    println!("{}:", title);
    if views.is_empty() {
        println!("   (none)");
        return;
    }

    for view in views {
        let (status, description) = match &view.annotation {
            Some(annotation) => (
                annotation.status.as_str(),
                annotation.description.as_deref().unwrap_or(""),
            ),
            None => ("unannotated", ""),
        };
        println!(
            "   #{} {} [{}] {}",
            view.image.id, view.image.filename, status, description
        );
        if let Some(annotation) = &view.annotation {
            if !annotation.tags.is_empty() {
                println!("      tags: {}", annotation.tags.join(", "));
            }
            if !annotation.colors.is_empty() {
                println!("      colors: {}", annotation.colors.join(", "));
            }
        }
        println!("      {}", view.original_url);
    }
}
