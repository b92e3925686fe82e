//! # CBAM Intake CLI (`intake`)
//!
//! The `intake` binary runs the intake pipeline from the command line and
//! starts the HTTP server used by the spreadsheet UI.
//!
//! ## Usage
//!
//! ```bash
//! intake --config ./config/intake.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `intake init` | Create the SQLite database and schema |
//! | `intake serve` | Start the HTTP server |
//! | `intake normalize <FILE>` | Normalize and classify a JSON rows file |
//! | `intake classify "<TEXT>"` | Classify one material text |
//! | `intake feedback --text T --label L` | Submit a label correction |
//! | `intake labels` | List the labels of the current corpus |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! intake init --config ./config/intake.toml
//!
//! # Normalize an exported sheet, with JSON progress on stderr
//! intake normalize ./march.json --progress json > march.normalized.json
//!
//! # Normalize and store the batch
//! intake normalize ./march.json --persist
//!
//! # Teach the classifier a new spelling
//! intake feedback --text "휘발유" --label gasoline
//! ```

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;

use cbam_intake::config;
use cbam_intake::logging;
use cbam_intake::migrate;
use cbam_intake::pipeline::PersistRequest;
use cbam_intake::progress::ProgressMode;
use cbam_intake::row_file;
use cbam_intake::server;
use cbam_intake::services::Services;
use cbam_intake_core::models::{FeedbackEvent, ProgressEvent};

/// CBAM Intake CLI: header unification, value normalization, and material
/// classification for CBAM reporting spreadsheets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/intake.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "intake",
    about = "CBAM Intake: normalize and classify reporting spreadsheets",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/intake.toml`. A missing file means all defaults.
    #[arg(long, global = true, default_value = "./config/intake.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Normalize and classify a JSON file of rows.
    ///
    /// The file holds either an array of row objects or
    /// `{"filename": "...", "data": [...]}`. The completed batch is printed
    /// to stdout as JSON; progress goes to stderr.
    Normalize {
        /// Path to the rows file.
        file: PathBuf,

        /// Progress output on stderr: `human`, `json`, or `off`.
        #[arg(long, default_value = "human")]
        progress: ProgressMode,

        /// Store the completed batch in the database.
        #[arg(long)]
        persist: bool,
    },

    /// Classify a single material text and print the result as JSON.
    Classify {
        /// The material text.
        text: String,
    },

    /// Submit a label correction (or, with `--correct`, a confirmation).
    Feedback {
        /// The material text as it appeared in the sheet.
        #[arg(long)]
        text: String,

        /// The correct label.
        #[arg(long)]
        label: String,

        /// The suggested label was already right.
        #[arg(long)]
        correct: bool,

        /// Free-form note stored with the event.
        #[arg(long)]
        note: Option<String>,
    },

    /// List the labels of the bootstrapped corpus.
    Labels,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Normalize {
            file,
            progress,
            persist,
        } => {
            let request = row_file::load_request(&file)?;
            let services = if persist {
                Services::open(&cfg).await?
            } else {
                Services::open_without_db(&cfg).await?
            };
            let reporter = progress.reporter();

            let mut events = Box::pin(services.orchestrator.process(request));
            let mut completed = None;
            while let Some(event) = events.next().await {
                reporter.report(&event);
                match event {
                    ProgressEvent::Completed {
                        job_id,
                        filename,
                        rows,
                        columns,
                    } => {
                        completed = Some((job_id, filename, rows, columns));
                    }
                    ProgressEvent::Error { kind, message } => {
                        anyhow::bail!("normalize failed ({}): {}", kind.as_str(), message);
                    }
                    _ => {}
                }
            }

            let Some((job_id, filename, rows, columns)) = completed else {
                anyhow::bail!("normalize ended without a result");
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job_id": job_id,
                    "filename": filename,
                    "columns": columns,
                    "rows": rows,
                }))?
            );

            if persist {
                let data = rows
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                let response = services
                    .orchestrator
                    .persist(PersistRequest {
                        filename,
                        data,
                        columns,
                    })
                    .await;
                if !response.success {
                    anyhow::bail!(
                        "persist failed ({}): {}",
                        response.error_kind.as_deref().unwrap_or("unknown"),
                        response.error.as_deref().unwrap_or(&response.message)
                    );
                }
                eprintln!("Persisted {} rows.", response.saved_count);
            }
        }
        Commands::Classify { text } => {
            let services = Services::open_without_db(&cfg).await?;
            let result = services.classifier.classify(&text).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Feedback {
            text,
            label,
            correct,
            note,
        } => {
            let services = Services::open_without_db(&cfg).await?;
            let mut event = FeedbackEvent::new(&text, &label, correct);
            event.note = note;
            let ack = services.feedback.submit(event).await?;
            println!(
                "Feedback recorded (corpus version {}, {}).",
                ack.corpus_version,
                if ack.corpus_changed {
                    "corpus updated"
                } else {
                    "already known"
                }
            );
        }
        Commands::Labels => {
            let services = Services::open_without_db(&cfg).await?;
            let (version, labels) = services.classifier.label_catalog();
            if labels.is_empty() {
                println!("No labels (corpus version {}).", version);
            } else {
                println!("Corpus version {}:", version);
                for label in labels {
                    println!(
                        "  {:<24} {:<24} {} exemplars",
                        label.id, label.name, label.exemplar_count
                    );
                }
            }
        }
    }

    Ok(())
}
