//! # ralph-cli
//!
//! Binary entry point for the Ralph loop runner.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Task-directory resolution and interactive selection
//! - Backend resolution with PRD-persisted preference
//! - Background worker spawning (detached supervisor child)
//! - Session commands: `status`, `stop`, `checkpoint`, `attach`, `clean`
//! - Shell completions via `ralph completions`

mod attach;
mod display;

use std::fs;
use std::io::{stdout, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use ralph_adapters::{detect_backends, is_backend_available, DEFAULT_PRIORITY};
use ralph_core::{
    pid_alive, task_name_from_dir, Git, LoopConfig, LoopRunner, PrdDoc, RalphPaths, SessionFilter,
    SessionRecord, SessionRegistry, SessionStatus, BUILTIN_TEMPLATE, DEFAULT_ITERATIONS,
};
use tracing::warn;

use display::{colors, status_table, truncate, use_colors};

/// Marks the detached supervisor child.
const WORKER_ENV: &str = "RALPH_WORKER";

/// Ralph - autonomous AI agent loop runner
#[derive(Parser, Debug)]
#[command(name = "ralph", version, about, disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Initialize user-scoped config (prompt template, data directories)
    #[arg(long)]
    init: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent loop for a task
    Run(RunArgs),

    /// Show status of sessions
    Status(StatusArgs),

    /// Stop a running session
    Stop(TaskArg),

    /// Checkpoint a running session (pause after the current iteration)
    Checkpoint(TaskArg),

    /// Attach to a running session
    Attach(TaskArg),

    /// Mark orphaned sessions failed in the registry
    Clean,

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Task directory (or bare task name under tasks/)
    task_dir: Option<String>,

    /// Maximum iterations
    #[arg(short = 'i', long = "max-iterations")]
    max_iterations: Option<u32>,

    /// Backend to use (claude, opencode)
    #[arg(short = 'a', long = "agent")]
    agent: Option<String>,

    /// Model override passed to the agent CLI
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Skip interactive prompts, use defaults
    #[arg(short = 'y', long = "yes")]
    skip_prompts: bool,

    /// Prompt template file
    #[arg(short = 'p', long = "prompt")]
    prompt_file: Option<PathBuf>,

    /// Skip the agent's own permission prompts
    #[arg(long)]
    yolo: bool,

    /// Run in the foreground instead of detaching a background worker
    #[arg(long)]
    foreground: bool,

    /// Replace a stale running registry row without complaint
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct TaskArg {
    /// Task name; defaults to the single running session
    task: Option<String>,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: clap_complete::Shell,
}

fn init_logging(verbose: bool, worker: bool) {
    let env_verbose = std::env::var_os("RALPH_VERBOSE").is_some();
    let filter = if verbose || env_verbose { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr);
    if worker {
        // Worker stdout/stderr go to the log file; no color codes there.
        builder.with_ansi(false).init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let worker = std::env::var_os(WORKER_ENV).is_some();
    init_logging(cli.verbose, worker);

    if cli.init {
        return code(init_command());
    }

    let result = match cli.command {
        Some(Commands::Run(args)) => run_command(args, worker).await,
        Some(Commands::Status(args)) => status_command(args),
        Some(Commands::Stop(args)) => stop_command(args).await,
        Some(Commands::Checkpoint(args)) => checkpoint_command(args).await,
        Some(Commands::Attach(args)) => attach_command(args).await,
        Some(Commands::Clean) => clean_command(),
        Some(Commands::Completions(args)) => completions_command(args),
        None => {
            Cli::command().print_help().ok();
            Ok(2)
        }
    };
    code(result)
}

fn code(result: Result<i32>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            // Configuration errors exit 2, everything else 1.
            let exit = e
                .downcast_ref::<ralph_core::RalphError>()
                .map(|re| re.exit_code())
                .unwrap_or(1);
            ExitCode::from(exit as u8)
        }
    }
}

// --- run ---

async fn run_command(args: RunArgs, worker: bool) -> Result<i32> {
    let paths = RalphPaths::resolve()?;

    let task_dir = match &args.task_dir {
        Some(input) => resolve_task_dir(input).ok_or_else(|| {
            ralph_core::RalphError::Config(format!(
                "task not found: '{input}' (expected a directory containing prd.json)"
            ))
        })?,
        None if args.skip_prompts => {
            anyhow::bail!(ralph_core::RalphError::Config(
                "TASK_DIR is required with --yes".into()
            ));
        }
        None => match prompt_task_selection()? {
            Some(dir) => dir,
            None => return Ok(2),
        },
    };

    let max_iterations = args.max_iterations.unwrap_or(DEFAULT_ITERATIONS);
    let agent = resolve_agent(args.agent.as_deref(), &task_dir, args.skip_prompts)?;
    let yolo = args.yolo || std::env::var_os("YOLO_MODE").is_some();

    if worker || args.foreground {
        let mut config = LoopConfig::new(task_dir.clone(), paths);
        config.max_iterations = max_iterations;
        config.model = args.model.clone();
        config.yolo = yolo;
        config.prompt_file = args.prompt_file.clone();
        config.force = args.force;

        let backends = detect_backends(Some(&agent));
        if backends.is_empty() {
            anyhow::bail!(ralph_core::RalphError::Config(format!(
                "backend '{agent}' is not installed and no fallback is available"
            )));
        }

        let task_name = task_name_from_dir(&task_dir);
        let outcome = LoopRunner::start(config, backends).await?;
        println!("{}", outcome.summary(&task_name));
        return Ok(outcome.exit_code());
    }

    spawn_background_worker(&args, &task_dir, max_iterations, &agent, yolo, &paths)
}

/// Detach a supervisor child running the same `run` invocation in the
/// foreground: own session, stdin null, output to the worker log.
fn spawn_background_worker(
    args: &RunArgs,
    task_dir: &Path,
    max_iterations: u32,
    agent: &str,
    yolo: bool,
    paths: &RalphPaths,
) -> Result<i32> {
    use std::os::unix::process::CommandExt;

    let task_name = task_name_from_dir(task_dir);
    let log_path = paths.worker_log(&task_name)?;
    let log = fs::File::create(&log_path)
        .with_context(|| format!("create worker log {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let exe = std::env::current_exe().context("resolve own executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("run")
        .arg(task_dir)
        .args(["-i", &max_iterations.to_string()])
        .args(["-a", agent])
        .arg("-y")
        .arg("--foreground");
    if yolo {
        cmd.arg("--yolo");
    }
    if args.force {
        cmd.arg("--force");
    }
    if let Some(model) = &args.model {
        cmd.args(["-m", model]);
    }
    if let Some(prompt) = &args.prompt_file {
        let absolute = prompt.canonicalize().unwrap_or_else(|_| prompt.clone());
        cmd.arg("-p").arg(absolute);
    }
    cmd.env(WORKER_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err);

    // Own session: closing the launching terminal must not signal the child.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| std::io::Error::other(e.to_string()))
        });
    }

    let mut child = cmd.spawn().context("spawn background worker")?;

    // Give it a moment to fail fast on configuration errors.
    std::thread::sleep(std::time::Duration::from_secs(1));
    if let Some(status) = child.try_wait()? {
        if !status.success() {
            eprintln!(
                "Error: background worker exited immediately ({status}).\n  Check the log: {}",
                log_path.display()
            );
            return Ok(1);
        }
    }

    let colored = use_colors();
    println!();
    println!(
        "{}",
        colors::green(&format!("Started background loop for '{task_name}'"), colored)
    );
    println!();
    println!("  ralph status               # Check progress");
    println!("  ralph attach {task_name}   # Watch / take control");
    println!("  ralph stop {task_name}     # Stop the loop");
    println!();
    println!("  Worker log: {}", log_path.display());
    Ok(0)
}

// --- task resolution ---

/// Resolve TASK_DIR input: a directory containing prd.json, a cwd-relative
/// path, or a bare task name under `<git-root>/tasks/`.
fn resolve_task_dir(input: &str) -> Option<PathBuf> {
    let as_path = PathBuf::from(input);
    if as_path.is_dir() && as_path.join("prd.json").is_file() {
        return as_path.canonicalize().ok();
    }
    if as_path.is_absolute() {
        return None;
    }

    let cwd_relative = std::env::current_dir().ok()?.join(&as_path);
    if cwd_relative.is_dir() && cwd_relative.join("prd.json").is_file() {
        return cwd_relative.canonicalize().ok();
    }

    let git_root = Git::toplevel(Path::new("."))?;
    let candidate = git_root.join("tasks").join(input);
    if candidate.is_dir() && candidate.join("prd.json").is_file() {
        return candidate.canonicalize().ok();
    }
    None
}

/// Active tasks: `./tasks/*/prd.json`, excluding `archived`.
fn find_active_tasks() -> Vec<PathBuf> {
    let tasks_dir = Path::new("tasks");
    let Ok(entries) = fs::read_dir(tasks_dir) else {
        return Vec::new();
    };
    let mut tasks: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| p.file_name().map(|n| n != "archived").unwrap_or(false))
        .filter(|p| p.join("prd.json").is_file())
        .collect();
    tasks.sort();
    tasks
}

fn display_task_info(task_dir: &Path) -> String {
    let summary = PrdDoc::load(&task_dir.join("prd.json"))
        .map(|doc| {
            format!(
                "[{}/{}] ({})",
                doc.prd.completed_count(),
                doc.prd.user_stories.len(),
                doc.prd.prd_type
            )
        })
        .unwrap_or_else(|_| "[?/?]".to_string());
    format!("{:<35} {summary}", task_dir.display().to_string())
}

fn prompt_task_selection() -> Result<Option<PathBuf>> {
    let tasks = find_active_tasks();

    if tasks.is_empty() {
        println!("No active tasks found under tasks/.");
        println!();
        println!("Create one by writing tasks/<effort-name>/prd.json, then:");
        println!("  ralph run tasks/<effort-name>");
        return Ok(None);
    }

    if tasks.len() == 1 {
        println!("Found one active task: {}", tasks[0].display());
        return Ok(Some(tasks[0].clone()));
    }

    println!();
    println!("Select a task:");
    for (i, task) in tasks.iter().enumerate() {
        println!("  {}) {}", i + 1, display_task_info(task));
    }
    println!();
    print!("Select task [1-{}]: ", tasks.len());
    stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let selection: usize = input.trim().parse().unwrap_or(1);
    match tasks.get(selection.saturating_sub(1)) {
        Some(task) => Ok(Some(task.clone())),
        None => {
            println!("Invalid selection.");
            Ok(None)
        }
    }
}

// --- agent resolution ---

/// Priority: CLI flag > `RALPH_AGENT` > prd.json saved agent > single
/// installed > interactive prompt (first installed with `-y`).
fn resolve_agent(cli_agent: Option<&str>, task_dir: &Path, skip_prompts: bool) -> Result<String> {
    if let Some(agent) = cli_agent {
        if !is_backend_available(agent) {
            warn!("agent '{agent}' not found on PATH");
        }
        return Ok(agent.to_string());
    }

    if let Ok(agent) = std::env::var("RALPH_AGENT")
        && !agent.is_empty()
    {
        return Ok(agent);
    }

    let prd_path = task_dir.join("prd.json");
    if let Ok(doc) = PrdDoc::load(&prd_path)
        && let Some(saved) = doc.prd.agent.clone()
    {
        if is_backend_available(&saved) {
            println!("Using saved agent: {saved}");
            return Ok(saved);
        }
        warn!("saved agent '{saved}' is not installed");
    }

    let installed: Vec<&str> = DEFAULT_PRIORITY
        .iter()
        .copied()
        .filter(|name| is_backend_available(name))
        .collect();

    if installed.is_empty() {
        anyhow::bail!(ralph_core::RalphError::Config(
            "no supported AI coding agent found; install claude or opencode".into()
        ));
    }
    if installed.len() == 1 || skip_prompts {
        return Ok(installed[0].to_string());
    }

    println!();
    println!("Available agents:");
    for (i, agent) in installed.iter().enumerate() {
        println!("  {}) {agent}", i + 1);
    }
    print!("Select agent [1-{}]: ", installed.len());
    stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let selection: usize = input.trim().parse().unwrap_or(1);
    let chosen = installed
        .get(selection.saturating_sub(1))
        .copied()
        .unwrap_or(installed[0]);

    // Remember the choice in the PRD for next time.
    if let Ok(mut doc) = PrdDoc::load(&prd_path)
        && doc.set_agent(chosen).is_ok()
    {
        println!("Agent preference saved to prd.json");
    }
    Ok(chosen.to_string())
}

// --- session commands ---

fn open_registry(paths: &RalphPaths) -> Result<SessionRegistry> {
    Ok(SessionRegistry::open(&paths.registry_db())?)
}

/// Resolve the target task for stop/checkpoint/attach: explicit name, or the
/// single running session.
fn resolve_session(registry: &SessionRegistry, task: Option<&str>) -> Result<SessionRecord> {
    if let Some(task) = task {
        return registry
            .get(task)?
            .ok_or_else(|| anyhow::anyhow!("no session found for task '{task}'"));
    }
    let running = registry.list(SessionFilter::Status(SessionStatus::Running))?;
    match running.len() {
        0 => anyhow::bail!("no running sessions"),
        1 => Ok(running.into_iter().next().unwrap()),
        n => anyhow::bail!("{n} running sessions; specify a task name"),
    }
}

/// Fire a parameterless control method at a loop's socket.
async fn send_control(record: &SessionRecord, method: &str) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let stream = tokio::net::UnixStream::connect(&record.socket_path)
        .await
        .with_context(|| format!("connect to {}", record.socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();
    let frame = format!(r#"{{"jsonrpc": "2.0", "id": 1, "method": "{method}"}}"#);
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    let response = tokio::time::timeout(std::time::Duration::from_secs(5), lines.next_line())
        .await
        .context("timed out waiting for response")??;
    response.ok_or_else(|| anyhow::anyhow!("connection closed before response"))?;
    Ok(())
}

async fn stop_command(args: TaskArg) -> Result<i32> {
    let paths = RalphPaths::resolve()?;
    let registry = open_registry(&paths)?;
    let record = match resolve_session(&registry, args.task.as_deref()) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(1);
        }
    };
    if record.status != SessionStatus::Running {
        eprintln!(
            "Error: session '{}' is not running (status: {})",
            record.task_name,
            record.status.as_str()
        );
        return Ok(1);
    }

    match send_control(&record, "stop").await {
        Ok(()) => {
            println!("Stop requested for '{}'", record.task_name);
            Ok(0)
        }
        Err(e) => {
            // Socket unreachable: fall back to signaling the supervisor.
            warn!("rpc stop failed ({e}), sending SIGTERM to pid {}", record.pid);
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(record.pid),
                nix::sys::signal::Signal::SIGTERM,
            );
            println!("Stop signal sent to '{}'", record.task_name);
            Ok(0)
        }
    }
}

async fn checkpoint_command(args: TaskArg) -> Result<i32> {
    let paths = RalphPaths::resolve()?;
    let registry = open_registry(&paths)?;
    let record = resolve_session(&registry, args.task.as_deref())?;
    if record.status != SessionStatus::Running {
        anyhow::bail!(
            "session '{}' is not running (status: {})",
            record.task_name,
            record.status.as_str()
        );
    }
    send_control(&record, "checkpoint").await?;
    println!(
        "Checkpoint requested for '{}'; it will pause after the current iteration",
        record.task_name
    );
    Ok(0)
}

async fn attach_command(args: TaskArg) -> Result<i32> {
    let paths = RalphPaths::resolve()?;
    let registry = open_registry(&paths)?;
    let record = resolve_session(&registry, args.task.as_deref())?;

    if record.status != SessionStatus::Running {
        eprintln!(
            "Error: session '{}' is not running (last status: {}).",
            record.task_name,
            record.status.as_str()
        );
        eprintln!("  Restart with: ralph run {}", record.task_dir.display());
        return Ok(1);
    }
    if !pid_alive(record.pid) {
        registry.mark_terminal(&record.task_name, SessionStatus::Failed, Some("orphaned"))?;
        eprintln!(
            "Error: session '{}' supervisor is gone; marked failed.",
            record.task_name
        );
        return Ok(1);
    }

    attach::attach(&record.socket_path, &record.task_name).await
}

fn status_command(args: StatusArgs) -> Result<i32> {
    let paths = RalphPaths::resolve()?;
    let registry = open_registry(&paths)?;

    // Revalidate running rows before printing; dead supervisors show as
    // failed (orphaned) rather than running forever.
    registry.clean()?;
    let records = registry.list(SessionFilter::All)?;

    if args.json {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "task_name": r.task_name,
                    "task_dir": r.task_dir,
                    "agent": r.agent,
                    "status": r.status.as_str(),
                    "status_reason": r.status_reason,
                    "started_at": r.started_at,
                    "updated_at": r.updated_at,
                    "iteration": r.last_iteration,
                    "max_iterations": r.max_iterations,
                    "pid": r.pid,
                    "socket_path": r.socket_path,
                    "last_port": r.last_port,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{}", status_table(&records, use_colors()));
    }
    Ok(0)
}

fn clean_command() -> Result<i32> {
    let paths = RalphPaths::resolve()?;
    let registry = open_registry(&paths)?;
    let orphaned = registry.clean()?;
    if orphaned.is_empty() {
        println!("No orphaned sessions.");
    } else {
        for task in &orphaned {
            println!("  Marked failed (orphaned): {}", truncate(task, 60));
        }
        println!("Cleaned {} session(s).", orphaned.len());
    }
    Ok(0)
}

fn init_command() -> Result<i32> {
    let paths = RalphPaths::resolve()?;
    fs::create_dir_all(paths.config_dir())?;
    fs::create_dir_all(paths.data_dir())?;

    let prompt_path = paths.default_prompt();
    if prompt_path.exists() {
        println!("Prompt template already exists: {}", prompt_path.display());
    } else {
        fs::write(&prompt_path, BUILTIN_TEMPLATE)?;
        println!("Wrote default prompt template: {}", prompt_path.display());
    }
    println!("Data directory: {}", paths.data_dir().display());

    let installed: Vec<&str> = DEFAULT_PRIORITY
        .iter()
        .copied()
        .filter(|name| is_backend_available(name))
        .collect();
    if installed.is_empty() {
        println!("Warning: no supported agent CLI found (claude, opencode).");
    } else {
        println!("Installed agents: {}", installed.join(", "));
    }
    Ok(0)
}

fn completions_command(args: CompletionsArgs) -> Result<i32> {
    let mut cli = Cli::command();
    clap_complete::generate(args.shell, &mut cli, "ralph", &mut std::io::stdout());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "ralph", "run", "tasks/demo", "-i", "25", "-a", "claude", "-m", "opus", "-y", "-p",
            "custom.md", "--foreground",
        ]);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.task_dir.as_deref(), Some("tasks/demo"));
                assert_eq!(args.max_iterations, Some(25));
                assert_eq!(args.agent.as_deref(), Some("claude"));
                assert_eq!(args.model.as_deref(), Some("opus"));
                assert!(args.skip_prompts);
                assert_eq!(args.prompt_file.as_deref(), Some(Path::new("custom.md")));
                assert!(args.foreground);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_init_flag() {
        let cli = Cli::parse_from(["ralph", "--init"]);
        assert!(cli.init);
        assert!(cli.command.is_none());
    }

    #[test]
    fn resolve_task_dir_requires_prd() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("tasks/thing");
        fs::create_dir_all(&task).unwrap();
        // No prd.json yet.
        assert!(resolve_task_dir(task.to_str().unwrap()).is_none());

        fs::write(task.join("prd.json"), "{}").unwrap();
        let resolved = resolve_task_dir(task.to_str().unwrap()).unwrap();
        assert!(resolved.ends_with("tasks/thing"));
    }

    #[test]
    fn task_arg_optional() {
        let cli = Cli::parse_from(["ralph", "stop"]);
        match cli.command {
            Some(Commands::Stop(args)) => assert!(args.task.is_none()),
            other => panic!("expected stop, got {other:?}"),
        }
    }
}
