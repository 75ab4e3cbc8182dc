// Armada CLI - multi-host deployment orchestration

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use armada::config::ArmadaConfig;
use armada::executor::{ConnectionManager, Executor, ExecutorConfig};
use armada::output::{ArmadaError, OutputFormat, OutputWriter};
use armada::tasks::{compiler, TaskRegistry};
use armada::telemetry::{HookManager, UsageReporter};
use armada::Vars;

#[derive(Parser)]
#[command(
    name = "armada",
    about = "Multi-host deployment orchestration over SSH",
    version,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,

    /// Path to the project config
    #[arg(short, long, global = true, default_value = "armada.yml")]
    config: PathBuf,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run a task against the selected hosts
    Run {
        /// Task to run
        task: String,

        /// Host selector: an alias, a stage, a role, or "all"
        selector: Option<String>,

        /// Maximum hosts executing a task at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// SSH user (overrides config)
        #[arg(short, long)]
        user: Option<String>,

        /// Path to SSH private key
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Prompt for SSH password
        #[arg(short = 'k', long)]
        ask_pass: bool,
    },

    /// List the invocable tasks
    List,

    /// Show the hosts a selector resolves to
    Hosts {
        /// Host selector: an alias, a stage, a role, or "all"
        selector: Option<String>,
    },

    /// Write a starter armada.yml in the current directory
    Init {
        /// Project name (defaults to the directory name)
        project: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("armada=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("armada=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let output_format = OutputFormat::from_str(&cli.output_format).unwrap_or_else(|_| {
        eprintln!("Invalid output format: {}. Using 'text'.", cli.output_format);
        OutputFormat::Text
    });

    let result = match cli.command {
        Commands::Run {
            task,
            selector,
            concurrency,
            user,
            private_key,
            ask_pass,
        } => {
            run_task(
                &cli.config,
                &task,
                selector,
                concurrency,
                user,
                private_key,
                ask_pass,
                cli.verbose,
                cli.quiet,
                output_format,
            )
            .await
        }
        Commands::List => list_tasks(&cli.config),
        Commands::Hosts { selector } => list_hosts(&cli.config, selector),
        Commands::Init { project } => init_project(project),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    config_path: &Path,
    task_name: &str,
    selector: Option<String>,
    concurrency: Option<usize>,
    user: Option<String>,
    private_key: Option<PathBuf>,
    ask_pass: bool,
    verbose: bool,
    quiet: bool,
    output_format: OutputFormat,
) -> Result<(), ArmadaError> {
    let config = ArmadaConfig::load(config_path)?;

    let mut tasks = TaskRegistry::new();
    config.register_tasks(&mut tasks)?;

    let task = tasks.get(task_name).ok_or_else(|| ArmadaError::UnknownTask {
        name: task_name.to_string(),
        referenced_by: None,
    })?;
    if task.private {
        return Err(ArmadaError::Config {
            message: format!(
                "task '{}' is private and can only run as a dependency or failure hook",
                task_name
            ),
            path: None,
        });
    }

    // Validate the whole plan before any connection is opened
    let plan = compiler::compile(&tasks, task_name)?;

    let hosts = config.build_host_registry()?;
    let selector = selector
        .or_else(|| config.default_stage.clone())
        .unwrap_or_else(|| "all".to_string());
    let targets = hosts.resolve(&selector)?;

    let mut connections = ConnectionManager::new()
        .with_connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .with_connect_retries(config.connect_retries);
    if let Some(user) = user {
        connections = connections.with_default_user(user);
    }
    if let Some(key) = private_key {
        connections = connections.with_default_identity(key.display().to_string());
    }
    if ask_pass {
        let password =
            rpassword::prompt_password("SSH password: ").map_err(|e| ArmadaError::Io {
                message: format!("failed to read password: {}", e),
                path: None,
            })?;
        connections = connections.with_password(password);
    }
    let connections = Arc::new(connections);

    let executor_config = ExecutorConfig::new()
        .with_concurrency(concurrency.unwrap_or(config.concurrency))
        .with_command_timeout(Duration::from_secs(config.command_timeout_secs));

    let executor = Executor::new(Arc::new(tasks), connections.clone(), executor_config)
        .with_globals(Vars::from_mapping(config.vars.clone()))
        .with_output(OutputWriter::new(output_format, verbose, quiet));

    // Ctrl-C requests a graceful stop: in-flight commands finish, the rest of
    // the plan is skipped
    let cancel = executor.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, letting in-flight tasks finish...");
            cancel.cancel();
        }
    });

    let report = executor.run(&plan, &targets).await;
    connections.close_all();

    let mut hooks = HookManager::new();
    if let Some(telemetry) = &config.telemetry {
        hooks.add(Box::new(UsageReporter::new(
            telemetry.endpoint.clone(),
            &config.project,
        )));
    }
    hooks.on_run_complete(task_name, &report).await;

    if !report.success() {
        std::process::exit(2);
    }
    Ok(())
}

fn list_tasks(config_path: &Path) -> Result<(), ArmadaError> {
    let config = ArmadaConfig::load(config_path)?;
    let mut tasks = TaskRegistry::new();
    config.register_tasks(&mut tasks)?;

    println!("{}", "Tasks:".bold());
    for task in tasks.tasks() {
        if task.private {
            continue;
        }
        if task.description.is_empty() {
            println!("  {}", task.name.cyan());
        } else {
            println!("  {}  {}", task.name.cyan(), task.description.dimmed());
        }
    }
    Ok(())
}

fn list_hosts(config_path: &Path, selector: Option<String>) -> Result<(), ArmadaError> {
    let config = ArmadaConfig::load(config_path)?;
    let hosts = config.build_host_registry()?;
    let selector = selector.unwrap_or_else(|| "all".to_string());
    let targets = hosts.resolve(&selector)?;

    println!("{} {}", "Hosts matching".bold(), selector.cyan());
    for host in &targets {
        let mut details = Vec::new();
        if let Some(stage) = &host.stage {
            details.push(format!("stage={}", stage));
        }
        if !host.roles.is_empty() {
            details.push(format!("roles={}", host.roles.join(",")));
        }
        println!(
            "  {} {} {}",
            host.alias.cyan(),
            host.ssh_target().dimmed(),
            details.join(" ").dimmed()
        );
    }
    Ok(())
}

fn init_project(project: Option<String>) -> Result<(), ArmadaError> {
    let path = Path::new("armada.yml");
    if path.exists() {
        return Err(ArmadaError::Config {
            message: "armada.yml already exists, refusing to overwrite".to_string(),
            path: Some(path.to_path_buf()),
        });
    }

    let project = project
        .or_else(|| {
            std::env::current_dir().ok().and_then(|dir| {
                dir.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
        })
        .unwrap_or_else(|| "my-app".to_string());

    std::fs::write(path, armada::config::scaffold(&project)).map_err(|e| ArmadaError::Io {
        message: format!("failed to write armada.yml: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    println!("{} armada.yml for project '{}'", "Created".green(), project);
    println!("Edit the host list, then try: {}", "armada run deploy".cyan());
    Ok(())
}
