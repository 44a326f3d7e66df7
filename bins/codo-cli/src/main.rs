mod commands;
mod generator;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codo_common::config::EngineConfig;
use codo_common::problems::RedisProblemStore;
use codo_common::queue::{QueueSettings, RedisQueue};
use codo_common::store::RedisStore;
use codo_common::types::Language;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "codo-cli")]
#[command(about = "Codo CLI - Seed problems, submit solutions, and inspect verdicts", long_about = None)]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new Codo project (writes config/languages.json)
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,

        /// Overwrite an existing languages.json
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Manage problems and their test cases
    Problem {
        #[command(subcommand)]
        command: ProblemCommands,
    },

    /// Submit a source file and wait for the verdict
    Submit {
        /// Problem id
        #[arg(short, long)]
        problem: String,

        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// Language (inferred from the file extension when omitted)
        #[arg(short, long)]
        language: Option<String>,

        /// Submitting user id
        #[arg(short, long, env = "CODO_USER", default_value = "cli")]
        user: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "120")]
        timeout: u64,

        /// Return right after queueing
        #[arg(long, default_value = "false")]
        no_wait: bool,
    },

    /// Show a submission
    Status {
        /// Submission id
        id: Uuid,
    },

    /// Cancel a pending submission
    Cancel {
        /// Submission id
        id: Uuid,
    },

    /// List a user's submissions
    List {
        /// User id
        #[arg(short, long, env = "CODO_USER", default_value = "cli")]
        user: String,
    },
}

#[derive(Subcommand)]
enum ProblemCommands {
    /// Create a problem from a JSON file
    Create {
        /// Problem JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Append a test case to a problem
    AddTest {
        /// Problem id
        #[arg(short, long)]
        problem: String,

        /// File fed to the program on stdin
        #[arg(short, long)]
        input: PathBuf,

        /// File holding the expected output
        #[arg(short, long)]
        expected: PathBuf,

        /// Hide the test case from participants
        #[arg(long, default_value = "false")]
        hidden: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { path, force } = &cli.command {
        return commands::init_project(path, *force).await;
    }

    let conn = codo_common::redis::connect(&cli.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", cli.redis_url))?;
    let store = RedisStore::new(conn.clone());
    let problems = RedisProblemStore::new(conn);
    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let settings = QueueSettings {
        ceiling: config.queue_ceiling,
        max_attempts: config.max_attempts,
        lease_ttl: config.lease_ttl,
    };
    let queue = || RedisQueue::connect(&cli.redis_url, settings);

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Problem { command } => match command {
            ProblemCommands::Create { file } => {
                commands::create_problem(&problems, &file).await?;
            }
            ProblemCommands::AddTest {
                problem,
                input,
                expected,
                hidden,
            } => {
                commands::add_test_case(&problems, &problem, &input, &expected, hidden).await?;
            }
        },
        Commands::Submit {
            problem,
            file,
            language,
            user,
            timeout,
            no_wait,
        } => {
            let language: Language = match language {
                Some(tag) => tag.parse()?,
                None => commands::language_for_path(&file)?,
            };
            let source = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let queue = queue().await?;

            let id =
                commands::submit(&store, &queue, &problems, &user, &problem, language, source)
                    .await?;
            if no_wait {
                return Ok(());
            }

            println!("⏳ Waiting for verdict...");
            let judged = commands::wait_for_verdict(
                &store,
                id,
                commands::POLL_INTERVAL,
                Duration::from_secs(timeout),
            )
            .await?;
            commands::print_submission(&judged);
        }
        Commands::Status { id } => {
            commands::show_status(&store, id).await?;
        }
        Commands::Cancel { id } => {
            let queue = queue().await?;
            commands::cancel(&store, &queue, id).await?;
        }
        Commands::List { user } => {
            commands::list_submissions(&store, &user).await?;
        }
    }

    Ok(())
}
