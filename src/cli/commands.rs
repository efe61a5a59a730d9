//! CLI command definitions for agent-dispatcher.
//!
//! `serve` runs the dispatcher; every other command is a one-shot
//! administrative call that prints JSON and exits without starting workers.

use std::collections::BTreeMap;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::ServiceConfig;
use crate::scheduler::job::{AgentConfig, HttpMethod, DEFAULT_QUEUE, DEFAULT_TIMEOUT_MS};
use crate::service::AgentService;

/// Scheduled HTTP agents and a singleton backlog task processor.
#[derive(Parser)]
#[command(name = "agent-dispatcher")]
#[command(about = "Schedule HTTP agents on Redis queues and drive the backlog task operator")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL; overrides REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run queue workers until interrupted.
    Serve,

    /// Create, inspect and delete agents.
    Agent(AgentArgs),

    /// Inspect and delete queues.
    Queue(QueueArgs),

    /// Control the backlog task operator.
    #[command(name = "task-operator")]
    TaskOperator(TaskOperatorArgs),
}

#[derive(Parser, Debug)]
pub struct AgentArgs {
    #[command(subcommand)]
    pub command: AgentSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum AgentSubcommand {
    /// Create a one-time or recurring agent.
    Create(AgentCreateArgs),
    /// List every agent with its status.
    List,
    /// Show one agent's status.
    Status(AgentNameArgs),
    /// Delete an agent and its pending jobs.
    Delete(AgentNameArgs),
}

/// Arguments for `agent-dispatcher agent create`.
#[derive(Parser, Debug)]
pub struct AgentCreateArgs {
    /// Unique name for the agent.
    #[arg(short, long)]
    pub name: String,

    /// Target URL to call.
    #[arg(short = 'u', long)]
    pub target_url: String,

    /// HTTP method (GET, POST, PUT, DELETE, PATCH).
    #[arg(short, long, default_value = "POST")]
    pub method: String,

    /// HTTP headers as a JSON object.
    #[arg(short = 'H', long, default_value = "{}")]
    pub headers: String,

    /// Request body as a JSON document.
    #[arg(short, long)]
    pub body: Option<String>,

    /// Cron pattern or interval in milliseconds. Required unless --one-time.
    #[arg(short, long)]
    pub schedule: Option<String>,

    /// Run the agent once, immediately.
    #[arg(short, long)]
    pub one_time: bool,

    /// Request timeout in milliseconds.
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout: u64,

    /// Queue for the agent's jobs.
    #[arg(short, long, default_value = DEFAULT_QUEUE)]
    pub queue: String,
}

#[derive(Parser, Debug)]
pub struct AgentNameArgs {
    /// Agent name.
    #[arg(short, long)]
    pub name: String,
}

#[derive(Parser, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum QueueSubcommand {
    /// List every queue with its counters.
    List,
    /// Show one queue's counters and agents.
    Info(QueueNameArgs),
    /// Delete an empty, non-default queue.
    Delete(QueueNameArgs),
}

#[derive(Parser, Debug)]
pub struct QueueNameArgs {
    /// Queue name.
    #[arg(short = 'q', long = "queue-name")]
    pub queue_name: String,
}

#[derive(Parser, Debug)]
pub struct TaskOperatorArgs {
    #[command(subcommand)]
    pub command: TaskOperatorSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum TaskOperatorSubcommand {
    /// Enable the task operator and start its tick chain.
    Enable {
        /// Queue for the tick chain; must match TASK_OPERATOR_QUEUE of the serving processes
        #[arg(short, long)]
        queue: Option<String>,
    },
    /// Disable the task operator.
    Disable,
    /// Show the lock without modifying it.
    Lock,
    /// Force-delete the lock. Only use when no task is in flight.
    ClearLock,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.redis_url.as_deref())?;

    match cli.command {
        Commands::Serve => run_serve(&config).await,
        Commands::Agent(args) => {
            let service = AgentService::connect(&config, false).await?;
            run_agent_command(&service, args.command).await
        }
        Commands::Queue(args) => {
            let service = AgentService::connect(&config, false).await?;
            run_queue_command(&service, args.command).await
        }
        Commands::TaskOperator(args) => {
            let config = task_operator_config(config, &args.command);
            let service = AgentService::connect(&config, false).await?;
            run_task_operator_command(&service, args.command).await
        }
    }
}

fn load_config(redis_url: Option<&str>) -> anyhow::Result<ServiceConfig> {
    ServiceConfig::from_lookup(|key| match (key, redis_url) {
        ("REDIS_URL", Some(url)) => Some(url.to_string()),
        _ => std::env::var(key).ok(),
    })
    .context("invalid configuration")
}

/// Applies a per-call task operator queue override.
fn task_operator_config(config: ServiceConfig, command: &TaskOperatorSubcommand) -> ServiceConfig {
    match command {
        TaskOperatorSubcommand::Enable { queue: Some(queue) } => {
            config.with_task_operator_queue(queue.clone())
        }
        _ => config,
    }
}

async fn run_serve(config: &ServiceConfig) -> anyhow::Result<()> {
    let service = AgentService::connect(config, true).await?;
    let queues = service.start().await?;
    service.resume_task_operator().await?;

    info!(queues = ?queues, "Dispatcher running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    service.shutdown().await;
    Ok(())
}

async fn run_agent_command(service: &AgentService, command: AgentSubcommand) -> anyhow::Result<()> {
    match command {
        AgentSubcommand::Create(args) => {
            let config = build_agent_config(args)?;
            let job = service.create_agent(config).await?;
            print_json(&job)
        }
        AgentSubcommand::List => print_json(&service.list_agents().await?),
        AgentSubcommand::Status(args) => print_json(&service.agent_status(&args.name).await?),
        AgentSubcommand::Delete(args) => print_json(&service.delete_agent(&args.name).await?),
    }
}

async fn run_queue_command(service: &AgentService, command: QueueSubcommand) -> anyhow::Result<()> {
    match command {
        QueueSubcommand::List => print_json(&service.list_queues().await?),
        QueueSubcommand::Info(args) => print_json(&service.queue_info(&args.queue_name).await?),
        QueueSubcommand::Delete(args) => {
            service.delete_queue(&args.queue_name).await?;
            print_json(&serde_json::json!({
                "success": true,
                "message": format!("Queue \"{}\" deleted", args.queue_name),
            }))
        }
    }
}

async fn run_task_operator_command(
    service: &AgentService,
    command: TaskOperatorSubcommand,
) -> anyhow::Result<()> {
    match command {
        TaskOperatorSubcommand::Enable { .. } => print_json(&service.enable_task_operator().await?),
        TaskOperatorSubcommand::Disable => print_json(&service.disable_task_operator().await?),
        TaskOperatorSubcommand::Lock => print_json(&service.task_operator_lock().await?),
        TaskOperatorSubcommand::ClearLock => {
            let cleared = service.clear_task_operator_lock().await?;
            print_json(&serde_json::json!({
                "success": true,
                "cleared": cleared,
            }))
        }
    }
}

/// Builds an agent descriptor from `agent create` arguments.
fn build_agent_config(args: AgentCreateArgs) -> anyhow::Result<AgentConfig> {
    let method: HttpMethod = args.method.parse()?;
    let headers: BTreeMap<String, String> = serde_json::from_str(&args.headers)
        .context("--headers must be a JSON object of string values")?;

    let mut config = AgentConfig::new(args.name, args.target_url)
        .with_method(method)
        .with_timeout_ms(args.timeout)
        .with_queue(args.queue);
    config.headers = headers;

    if let Some(body) = args.body {
        let body = serde_json::from_str(&body).context("--body must be valid JSON")?;
        config = config.with_body(body);
    }
    if let Some(schedule) = args.schedule {
        config = config.with_schedule(schedule);
    }
    if args.one_time {
        config = config.one_time();
    }

    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn create_args(extra: &[&str]) -> AgentCreateArgs {
        let mut argv = vec!["agent-dispatcher", "agent", "create", "-n", "ping", "-u", "http://t/x"];
        argv.extend_from_slice(extra);
        let cli = Cli::try_parse_from(argv).expect("should parse");
        match cli.command {
            Commands::Agent(AgentArgs {
                command: AgentSubcommand::Create(args),
            }) => args,
            _ => panic!("Expected agent create"),
        }
    }

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_agent_create_defaults() {
        let args = create_args(&[]);
        assert_eq!(args.method, "POST");
        assert_eq!(args.headers, "{}");
        assert_eq!(args.timeout, 30_000);
        assert_eq!(args.queue, "default");
        assert!(!args.one_time);
    }

    #[test]
    fn test_build_recurring_config() {
        let args = create_args(&[
            "-m",
            "get",
            "-H",
            r#"{"Authorization": "Bearer t"}"#,
            "-s",
            "0 */5 * * * *",
            "-q",
            "reports",
        ]);
        let config = build_agent_config(args).unwrap();
        assert_eq!(config.method, HttpMethod::Get);
        assert_eq!(config.headers["Authorization"], "Bearer t");
        assert_eq!(config.schedule.as_deref(), Some("0 */5 * * * *"));
        assert_eq!(config.queue, "reports");
        assert!(!config.one_time);
    }

    #[test]
    fn test_build_config_rejects_bad_input() {
        assert!(build_agent_config(create_args(&[])).is_err());
        assert!(build_agent_config(create_args(&["-o", "-m", "TRACE"])).is_err());
        assert!(build_agent_config(create_args(&["-o", "-H", "[1]"])).is_err());
        assert!(build_agent_config(create_args(&["-o", "-b", "{not json"])).is_err());
    }

    #[test]
    fn test_one_time_with_body() {
        let config =
            build_agent_config(create_args(&["-o", "-b", r#"{"action": "sync"}"#])).unwrap();
        assert!(config.one_time);
        assert_eq!(config.body, Some(serde_json::json!({"action": "sync"})));
    }

    #[test]
    fn test_task_operator_subcommands() {
        let cli = Cli::try_parse_from(["agent-dispatcher", "task-operator", "clear-lock"])
            .expect("should parse");
        assert!(matches!(
            cli.command,
            Commands::TaskOperator(TaskOperatorArgs {
                command: TaskOperatorSubcommand::ClearLock
            })
        ));

        let cli = Cli::try_parse_from(["agent-dispatcher", "queue", "info", "-q", "reports"])
            .expect("should parse");
        assert!(matches!(
            cli.command,
            Commands::Queue(QueueArgs {
                command: QueueSubcommand::Info(QueueNameArgs { ref queue_name })
            }) if queue_name == "reports"
        ));
    }

    #[test]
    fn test_enable_queue_override() {
        let cli = Cli::try_parse_from(["agent-dispatcher", "task-operator", "enable", "-q", "ops-ticks"])
            .expect("should parse");
        let Commands::TaskOperator(args) = cli.command else {
            panic!("expected task-operator command");
        };
        let config = task_operator_config(ServiceConfig::default(), &args.command);
        assert_eq!(config.task_operator_queue, "ops-ticks");

        let cli = Cli::try_parse_from(["agent-dispatcher", "task-operator", "enable"])
            .expect("should parse");
        let Commands::TaskOperator(args) = cli.command else {
            panic!("expected task-operator command");
        };
        let config = task_operator_config(ServiceConfig::default(), &args.command);
        assert_eq!(config.task_operator_queue, "task-operator");
    }
}
