//! TaskBrew CLI entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskbrew::adapters::runners::{ClaudeCliConfig, ClaudeCliRunner};
use taskbrew::application::orchestrator::SHUTDOWN_TIMEOUT_SECS;
use taskbrew::domain::models::{RoleConfig, TeamConfig};
use taskbrew::domain::ports::clock::system_clock;
use taskbrew::infrastructure::logging::{self, LogConfig};
use taskbrew::services::config::{load_roles, load_team_config, validate_routing};
use taskbrew::Orchestrator;

#[derive(Parser)]
#[command(name = "taskbrew", about = "Multi-agent AI team orchestrator", version)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator: agent loops, recovery, and the dashboard API.
    Serve,
    /// Submit a new goal to the PM role.
    Goal {
        /// Goal title.
        title: String,
        /// Goal description.
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Show team status: groups, agents, and the task board.
    Status,
    /// Initialize a new project (config skeleton).
    Init,
    /// Check system requirements and configuration.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("cwd"));

    match cli.command {
        Commands::Init => {
            cmd_init(&project_dir)?;
            return Ok(());
        }
        Commands::Doctor => {
            cmd_doctor(&project_dir).await;
            return Ok(());
        }
        _ => {}
    }

    let _log_guard = logging::init(&LogConfig::default())?;
    let (team, roles) = load_project_config(&project_dir)?;

    match cli.command {
        Commands::Serve => cmd_serve(team, roles).await,
        Commands::Goal { title, description } => cmd_goal(team, roles, &title, &description).await,
        Commands::Status => cmd_status(team, roles).await,
        Commands::Init | Commands::Doctor => unreachable!(),
    }
}

fn load_project_config(project_dir: &Path) -> Result<(TeamConfig, HashMap<String, RoleConfig>)> {
    let config_dir = project_dir.join("config");
    let team = load_team_config(&config_dir.join("team.yaml"))
        .context("failed to load team configuration")?;
    let roles = load_roles(&config_dir.join("roles")).context("failed to load role files")?;

    let errors = validate_routing(&roles);
    if !errors.is_empty() {
        for err in &errors {
            eprintln!("  Routing error: {err}");
        }
        anyhow::bail!("configuration has {} routing error(s)", errors.len());
    }

    Ok((team, roles))
}

async fn build(
    team: TeamConfig,
    roles: HashMap<String, RoleConfig>,
) -> Result<Arc<Orchestrator>> {
    let runner = Arc::new(ClaudeCliRunner::new(ClaudeCliConfig {
        binary_path: team.cli_provider.clone(),
        ..ClaudeCliConfig::default()
    }));
    // Worktree isolation is provided by an external integration; the
    // default workspace runs shell-capable roles in the project directory.
    let workspace: Arc<dyn taskbrew::domain::ports::Workspace> =
        Arc::new(taskbrew::domain::ports::workspace::NoWorkspace);
    Orchestrator::build(team, roles, runner, Some(workspace), system_clock())
        .await
        .context("failed to initialize orchestrator")
}

async fn cmd_serve(team: TeamConfig, roles: HashMap<String, RoleConfig>) -> Result<()> {
    if roles.is_empty() {
        anyhow::bail!("no role files found in config/roles/ — run `taskbrew init` first");
    }

    let host = team.dashboard_host.clone();
    let port = team.dashboard_port;
    let orch = build(team, roles).await?;
    orch.start().await.context("orchestrator startup failed")?;

    let api = {
        let orch = orch.clone();
        let host = host.clone();
        tokio::spawn(async move { taskbrew::api::serve(orch, &host, port).await })
    };

    tokio::signal::ctrl_c().await.context("signal handler")?;
    println!("\nShutting down...");
    orch.shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS)).await;
    api.abort();
    Ok(())
}

async fn cmd_goal(
    team: TeamConfig,
    roles: HashMap<String, RoleConfig>,
    title: &str,
    description: &str,
) -> Result<()> {
    let orch = build(team, roles).await?;
    // Register prefixes without spawning agents.
    let prefixes: HashMap<String, String> = orch
        .roles()
        .iter()
        .map(|(name, role)| (name.clone(), role.prefix.clone()))
        .collect();
    orch.board().register_prefixes(prefixes).await?;

    let (group, task) = orch.submit_goal(title, description).await?;
    println!("Goal submitted: {}", group.id);
    println!("  Group: {} — {title}", group.id);
    println!("  Task:  {} — assigned to PM", task.id);

    orch.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

async fn cmd_status(team: TeamConfig, roles: HashMap<String, RoleConfig>) -> Result<()> {
    let orch = build(team, roles).await?;

    let groups = orch.board().get_groups(None).await?;
    let instances = orch.instances().get_all_instances().await?;
    let board = orch
        .board()
        .get_board(&taskbrew::services::BoardFilters::default())
        .await?;

    println!("\n=== TaskBrew Status ===\n");

    let mut group_table = Table::new();
    group_table.set_header(["Group", "Title", "Status"]);
    for group in &groups {
        group_table.add_row([group.id.as_str(), group.title.as_str(), group.status.as_str()]);
    }
    println!("{group_table}");

    let mut agent_table = Table::new();
    agent_table.set_header(["Instance", "Role", "Status", "Current Task"]);
    for instance in &instances {
        agent_table.add_row([
            instance.instance_id.as_str(),
            instance.role.as_str(),
            instance.status.as_str(),
            instance.current_task.as_deref().unwrap_or("-"),
        ]);
    }
    println!("{agent_table}");

    println!("Task Board:");
    for (status, tasks) in &board {
        println!("  {status}: {}", tasks.len());
        for task in tasks {
            println!("    {}: {}", task.id, task.title);
        }
    }

    orch.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

fn cmd_init(project_dir: &Path) -> Result<()> {
    let config_dir = project_dir.join("config");
    let roles_dir = config_dir.join("roles");
    std::fs::create_dir_all(&roles_dir)?;
    println!("Initializing taskbrew project in {}", project_dir.display());

    let team_yaml = config_dir.join("team.yaml");
    if !team_yaml.exists() {
        std::fs::write(
            &team_yaml,
            "team_name: \"my-team\"\n\
             db_path: \".taskbrew/taskbrew.db\"\n\
             dashboard_host: \"127.0.0.1\"\n\
             dashboard_port: 8420\n\
             default_poll_interval: 5.0\n\
             cli_provider: \"claude\"\n\
             \n\
             guardrails:\n\
             \x20 max_task_depth: 10\n\
             \x20 max_tasks_per_group: 50\n\
             \x20 rejection_cycle_limit: 3\n",
        )?;
        println!("  Created config/team.yaml");
    }

    let pm_yaml = roles_dir.join("pm.yaml");
    if !pm_yaml.exists() {
        std::fs::write(
            &pm_yaml,
            "role: pm\n\
             display_name: \"Project Manager\"\n\
             prefix: \"PM\"\n\
             \n\
             system_prompt: |\n\
             \x20 You are the Project Manager. Break down user requests into\n\
             \x20 clear, actionable tasks and delegate to the appropriate agents.\n\
             \n\
             model: claude-sonnet-4-6\n\
             tools: [Read, Glob, Grep]\n\
             \n\
             accepts: [goal]\n\
             produces: [tech_design, implementation, verification]\n\
             \n\
             routing_mode: open\n\
             can_create_groups: true\n\
             group_type: \"FEAT\"\n\
             \n\
             max_instances: 1\n\
             max_turns: 30\n\
             max_execution_time: 1800\n",
        )?;
        println!("  Created config/roles/pm.yaml");
    }

    println!("\nProject initialized! Next steps:");
    println!("  1. Add more roles in config/roles/");
    println!("  2. Run: taskbrew serve");
    Ok(())
}

async fn cmd_doctor(project_dir: &Path) {
    println!("TaskBrew Doctor\n");
    let mut all_ok = true;

    let runner = ClaudeCliRunner::new(ClaudeCliConfig::default());
    if runner.is_available().await {
        println!("  [OK] Claude CLI found");
    } else {
        println!("  [WARN] Claude CLI not found (install: npm install -g @anthropic-ai/claude-code)");
    }

    let config_dir = project_dir.join("config");
    let team_yaml = config_dir.join("team.yaml");
    if team_yaml.exists() {
        match load_team_config(&team_yaml) {
            Ok(team) => {
                println!("  [OK] config/team.yaml validates successfully");
                let db_dir = Path::new(&team.db_path)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                if db_dir.as_os_str().is_empty() || std::fs::create_dir_all(&db_dir).is_ok() {
                    println!("  [OK] Database directory writable");
                } else {
                    println!("  [FAIL] Database directory not writable: {}", db_dir.display());
                    all_ok = false;
                }
            }
            Err(err) => {
                println!("  [FAIL] team.yaml invalid: {err}");
                all_ok = false;
            }
        }
    } else {
        println!("  [WARN] config/team.yaml not found (run: taskbrew init)");
    }

    match load_roles(&config_dir.join("roles")) {
        Ok(roles) if !roles.is_empty() => {
            println!("  [OK] {} role(s) found in config/roles/", roles.len());
            for err in validate_routing(&roles) {
                println!("  [FAIL] {err}");
                all_ok = false;
            }
        }
        Ok(_) => println!("  [WARN] No roles found in config/roles/"),
        Err(err) => {
            println!("  [FAIL] {err}");
            all_ok = false;
        }
    }

    println!();
    if all_ok {
        println!("All checks passed!");
    } else {
        println!("Some checks failed. Fix the issues above and run again.");
    }
}
