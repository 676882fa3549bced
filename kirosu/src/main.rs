use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use kirosu::agent::{KiroAgent, DEFAULT_POLL_INTERVAL};
use kirosu::client::HubClient;
use kirosu::config::{AgentConfig, EndpointConfig, FileConfig, HubConfig, MODEL_ENV};
use kirosu::hub;
use kirosu::provider;

#[derive(Parser, Debug)]
#[command(name = "kirosu")]
#[command(about = "LLM worker swarm: hub, agents, and a durable task queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the swarm hub (task store + RPC server).
    Hub(HubConfig),

    /// Run a worker agent against a hub.
    Agent(AgentConfig),

    /// Enqueue a task on the hub.
    Enqueue {
        /// The prompt to execute.
        prompt: String,

        /// Optional system prompt.
        #[arg(long)]
        system_prompt: Option<String>,

        /// Task type tag (`chat`, `python`, `human`, ...).
        #[arg(long = "type", default_value = "chat")]
        task_type: String,

        #[command(flatten)]
        endpoint: EndpointConfig,
    },

    /// List tasks and queue stats.
    Status {
        /// Filter by status (queued|leased|done|failed).
        #[arg(long)]
        status: Option<String>,

        /// Limit results (0 or less means unbounded).
        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[command(flatten)]
        endpoint: EndpointConfig,
    },

    /// Approve a human-gated task.
    Approve {
        /// ID of the task to approve.
        task_id: i64,

        #[command(flatten)]
        endpoint: EndpointConfig,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Hub(cfg) => {
            let _guard = init_logging(false, None)?;
            let file = FileConfig::load();
            let db_path = cfg.db.clone().unwrap_or_else(|| file.database_path());
            hub::run(&cfg, &db_path).await
        }
        Command::Agent(cfg) => {
            let _guard = init_logging(cfg.verbose, cfg.log_file.as_deref())?;
            let file = FileConfig::load();
            let model = cfg
                .model
                .clone()
                .or_else(|| file.model.clone())
                .or_else(|| std::env::var(MODEL_ENV).ok());
            let workdir = cfg.workdir.clone().or_else(|| file.workdir.clone());

            let provider = provider::get_provider(None, model);
            let client = HubClient::new(cfg.endpoint.host.clone(), cfg.endpoint.port);
            let agent = KiroAgent::new(client, provider, workdir);
            tracing::info!(
                host = %cfg.endpoint.host,
                port = cfg.endpoint.port,
                worker_id = %agent.worker_id(),
                "connecting agent to hub"
            );
            agent.run(DEFAULT_POLL_INTERVAL).await
        }
        Command::Enqueue {
            prompt,
            system_prompt,
            task_type,
            endpoint,
        } => {
            let _guard = init_logging(false, None)?;
            let mut client = HubClient::new(endpoint.host, endpoint.port);
            let task_id = client
                .enqueue(&prompt, system_prompt.as_deref(), Some(&task_type))
                .await?;
            println!("Task enqueued. ID: {task_id}");
            Ok(())
        }
        Command::Status {
            status,
            limit,
            endpoint,
        } => {
            let _guard = init_logging(false, None)?;
            let mut client = HubClient::new(endpoint.host, endpoint.port);
            let (tasks, stats) = client.list(status.as_deref(), limit).await?;

            println!(
                "Stats: queued={} leased={} done={} failed={} total={} last_hour={} avg_sec={} err%={}",
                stats.queued,
                stats.leased,
                stats.done,
                stats.failed,
                stats.total_tasks,
                stats.completed_last_hour,
                stats.avg_completion_time_sec,
                stats.error_rate_percent,
            );
            println!("{:-<60}", "");
            println!("{:<5} | {:<10} | {:<40}", "ID", "Status", "Prompt");
            println!("{:-<60}", "");
            for task in &tasks {
                let mut prompt = task.prompt.replace('\n', " ");
                if prompt.chars().count() > 37 {
                    prompt = format!("{}...", prompt.chars().take(37).collect::<String>());
                }
                println!("{:<5} | {:<10} | {:<40}", task.task_id, task.status, prompt);
                if let Some(result) = &task.result {
                    println!("  Result: {}", result.chars().take(100).collect::<String>());
                }
                if let Some(error) = &task.error {
                    println!("  Error: {error}");
                }
            }
            Ok(())
        }
        Command::Approve { task_id, endpoint } => {
            let _guard = init_logging(false, None)?;
            let mut client = HubClient::new(endpoint.host, endpoint.port);
            client.approve(task_id).await?;
            println!("Task {task_id} approved.");
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().context("log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer.and(std::io::stderr))
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}
