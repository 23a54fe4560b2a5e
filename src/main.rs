mod agent;
mod assistant;
mod config;
mod guards;
mod mail;
mod mailbox;
mod merge;
mod nudge;
mod orchestrator;
mod overlay;
mod process;
mod session;
mod watchdog;
mod worktree;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use agent::{AgentManager, Capability, SpawnRequest};
use assistant::Assistant;
use config::{ORCHESTRATOR, OverstoryConfig};
use mail::Mailer;
use mailbox::{MailFilter, Mailbox, MarkOutcome, MessageType, NewMessage, Priority};
use nudge::NudgeRegistry;

#[derive(Parser)]
#[command(name = "overstory", about = "Orchestrate a swarm of autonomous coding agents")]
struct Cli {
    /// Repository root (default: current directory)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .overstory/ with a default config and state directories
    Init,
    /// Spawn an agent: isolated worktree, guards, overlay, tmux session
    Sling {
        /// Task identifier from the issue tracker
        #[arg(long)]
        task: String,
        #[arg(long, value_enum)]
        capability: Capability,
        /// Unique agent name (session and branch fragment)
        #[arg(long)]
        name: String,
        /// Path to the task spec
        #[arg(long)]
        spec: Option<String>,
        /// Comma-separated file scope
        #[arg(long)]
        files: Option<String>,
        #[arg(long, default_value = "")]
        parent: String,
        #[arg(long, default_value_t = 0)]
        depth: u32,
        /// Branch to fork from (default: canonical)
        #[arg(long)]
        base: Option<String>,
    },
    /// The shared mailbox
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },
    /// Drain the merge queue sequentially
    Merge,
    /// Run the watchdog until interrupted
    Watch,
    /// Show live agents and pending merges
    Status,
    /// Tear down an agent: kill session, drop worktree, forget record
    Teardown { name: String },
}

#[derive(Subcommand)]
enum MailCommands {
    Send {
        #[arg(long)]
        to: String,
        #[arg(long, default_value = ORCHESTRATOR)]
        from: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        #[arg(long = "type", value_enum, default_value = "status")]
        msg_type: MessageType,
        #[arg(long, value_enum, default_value = "normal")]
        priority: Priority,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    List {
        /// Recipient filter; wins over --agent when both are given
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        unread: bool,
    },
    /// Print a message and mark it read
    Read { id: i64 },
    /// Flip a message back to unread
    Unread { id: i64 },
    Reply {
        id: i64,
        #[arg(long)]
        body: String,
        #[arg(long, default_value = ORCHESTRATOR)]
        agent: String,
    },
    /// Hook entry point: emit pending nudge banner + unread mail
    Check {
        #[arg(long)]
        inject: bool,
        #[arg(long)]
        agent: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init => cmd_init(&cli.project),
        Commands::Sling {
            task,
            capability,
            name,
            spec,
            files,
            parent,
            depth,
            base,
        } => cmd_sling(&cli.project, task, capability, name, spec, files, parent, depth, base),
        Commands::Mail { command } => cmd_mail(&cli.project, command),
        Commands::Merge => cmd_merge(&cli.project),
        Commands::Watch => cmd_watch(&cli.project),
        Commands::Status => cmd_status(&cli.project),
        Commands::Teardown { name } => cmd_teardown(&cli.project, &name),
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

fn cmd_init(project: &Path) {
    let path = config::config_path(project);
    if path.exists() {
        println!("Already initialized: {}", path.display());
    } else if let Err(e) = OverstoryConfig::default().save(project) {
        fail(e);
    }
    for dir in [
        config::nudges_dir(project),
        config::worktrees_dir(project),
        config::hooks_dir(project),
        config::specs_dir(project),
    ] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            fail(e);
        }
    }
    println!("Initialized overstory state in {}", config::state_dir(project).display());
    println!("  config.toml       operator config");
    println!("  pending-nudges/   deferred priority notifications");
    println!("  worktrees/        agent checkouts");
    println!("  hooks/            deployed guard policies");
    println!("  specs/            per-task specs");
}

fn open_state(project: &Path) -> (OverstoryConfig, Mailbox, NudgeRegistry) {
    let config = match OverstoryConfig::load(project) {
        Ok(c) => c,
        Err(e) => fail(e),
    };
    let store = match Mailbox::open(config::mail_db_path(project)) {
        Ok(s) => s,
        Err(e) => fail(e),
    };
    let nudges = NudgeRegistry::new(config::nudges_dir(project));
    (config, store, nudges)
}

#[allow(clippy::too_many_arguments)]
fn cmd_sling(
    project: &Path,
    task: String,
    capability: Capability,
    name: String,
    spec: Option<String>,
    files: Option<String>,
    parent: String,
    depth: u32,
    base: Option<String>,
) {
    let (config, store, _) = open_state(project);
    let manager = AgentManager::new(project, &config, &store);

    let file_scope: Vec<String> = files
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    // Leads drop specs at .overstory/specs/<task>.md; pick that up when no
    // explicit --spec was given.
    let spec = spec.or_else(|| {
        let default = config::specs_dir(project).join(format!("{task}.md"));
        default
            .exists()
            .then(|| default.to_string_lossy().into_owned())
    });

    let request = SpawnRequest {
        name,
        capability,
        task_id: task,
        parent,
        depth,
        spec_path: spec,
        file_scope,
        base_branch: base,
    };

    match manager.spawn(&request) {
        Ok(record) => {
            println!("Spawned {} ({})", record.name, record.capability.as_str());
            println!("  branch:   {}", record.branch);
            println!("  worktree: {}", record.worktree_path.display());
            println!("  session:  {}", record.session_name());
            if let Some(pid) = record.session_pid {
                println!("  pid:      {pid}");
            }
        }
        Err(e) => fail(e),
    }
}

fn cmd_mail(project: &Path, command: MailCommands) {
    let (_, store, nudges) = open_state(project);
    let mailer = Mailer::new(&store, &nudges);

    match command {
        MailCommands::Send {
            to,
            from,
            subject,
            body,
            msg_type,
            priority,
            json,
        } => {
            let result = mailer.send(NewMessage {
                from,
                to: to.clone(),
                subject,
                body,
                msg_type,
                priority,
                payload: None,
            });
            match result {
                Ok(id) if json => println!("{}", serde_json::json!({ "id": id })),
                Ok(id) => println!("Sent message #{id} to {to}"),
                Err(e) => fail(e),
            }
        }
        MailCommands::List {
            to,
            agent,
            from,
            unread,
        } => {
            let filter = MailFilter {
                from,
                to: to.or(agent),
                unread_only: unread,
                limit: None,
            };
            match mailer.list(&filter) {
                Ok(messages) => {
                    if messages.is_empty() {
                        println!("No messages.");
                        return;
                    }
                    for msg in messages {
                        let marker = if msg.is_unread() { "*" } else { " " };
                        println!(
                            "#{:<5}{} {} -> {}  [{}/{}]  {}",
                            msg.id,
                            marker,
                            msg.from,
                            msg.to,
                            msg.msg_type.as_str(),
                            msg.priority.as_str(),
                            msg.subject
                        );
                    }
                }
                Err(e) => fail(e),
            }
        }
        MailCommands::Read { id } => {
            let msg = match store.get(id) {
                Ok(m) => m,
                Err(e) => fail(e),
            };
            println!("From:     {}", msg.from);
            println!("To:       {}", msg.to);
            println!("Subject:  {}", msg.subject);
            println!(
                "Type:     {}  Priority: {}",
                msg.msg_type.as_str(),
                msg.priority.as_str()
            );
            println!("Date:     {}", msg.created_at.to_rfc3339());
            if let Some(original) = msg.in_reply_to {
                println!("In-Reply-To: #{original}");
            }
            println!();
            println!("{}", msg.body);
            match store.mark_read(id) {
                Ok(MarkOutcome::Marked) => {}
                Ok(MarkOutcome::AlreadyRead) => println!("(already read)"),
                Err(e) => fail(e),
            }
        }
        MailCommands::Unread { id } => match store.mark_unread(id) {
            Ok(()) => println!("Marked #{id} unread"),
            Err(e) => fail(e),
        },
        MailCommands::Reply { id, body, agent } => match mailer.reply(id, &agent, &body) {
            Ok(reply_id) => println!("Sent reply #{reply_id}"),
            Err(e) => fail(e),
        },
        MailCommands::Check { inject, agent } => {
            let result = if inject {
                mailer.check_inject(&agent)
            } else {
                mailer.check_summary(&agent)
            };
            match result {
                Ok(text) if inject => print!("{text}"),
                Ok(text) => println!("{text}"),
                Err(e) => fail(e),
            }
        }
    }
}

fn cmd_merge(project: &Path) {
    let (config, store, nudges) = open_state(project);
    match orchestrator::drain_merge_queue(project, &config, &store, &nudges) {
        Ok(outcomes) => {
            if outcomes.is_empty() {
                println!("Merge queue is empty.");
                return;
            }
            let mut failed = 0;
            for outcome in &outcomes {
                if outcome.success {
                    let tier = outcome.tier.map(|t| t.as_str()).unwrap_or("?");
                    println!("[merged] {} ({tier})", outcome.entry.branch_name);
                } else {
                    failed += 1;
                    println!(
                        "[failed] {}: {}",
                        outcome.entry.branch_name,
                        outcome.error_message.as_deref().unwrap_or("unknown")
                    );
                }
            }
            if failed > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => fail(e),
    }
}

fn cmd_watch(project: &Path) {
    let (config, store, _) = open_state(project);
    let manager = AgentManager::new(project, &config, &store);
    let assistant = Assistant::from_config(&config.assistant);
    let mut daemon = watchdog::WatchdogDaemon::new(
        config.watchdog.clone(),
        &store,
        &manager,
        &assistant,
    );

    println!(
        "Watching agents every {}ms (stale {}ms, zombie {}ms). Ctrl-C to stop.",
        config.watchdog.tier1_interval_ms,
        config.watchdog.stale_threshold_ms,
        config.watchdog.zombie_threshold_ms
    );

    daemon.run();
}

struct StatusRow {
    name: String,
    capability: Capability,
    task_id: String,
    depth: u32,
    branch: String,
    session_alive: bool,
    unread: usize,
}

fn render_status(rows: &[StatusRow], pending_merges: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("Agents: {} live\n", rows.len()));
    for row in rows {
        let alive = if row.session_alive { "up" } else { "DOWN" };
        out.push_str(&format!(
            "  {:<12} {:<11} task {:<8} depth {}  [{}]  {} unread  {}\n",
            row.name,
            row.capability.as_str(),
            row.task_id,
            row.depth,
            alive,
            row.unread,
            row.branch,
        ));
    }
    out.push_str(&format!("Pending merges: {pending_merges}\n"));
    out
}

fn cmd_status(project: &Path) {
    let (_, store, _) = open_state(project);

    let agents = match store.list_agents() {
        Ok(a) => a,
        Err(e) => fail(e),
    };
    let rows: Vec<StatusRow> = agents
        .into_iter()
        .map(|rec| {
            let unread = store.unread_for(&rec.name).map(|m| m.len()).unwrap_or(0);
            StatusRow {
                session_alive: session::is_alive(&rec.session_name()),
                name: rec.name,
                capability: rec.capability,
                task_id: rec.task_id,
                depth: rec.depth,
                branch: rec.branch,
                unread,
            }
        })
        .collect();

    let pending = match orchestrator::collect_ready(&store) {
        Ok(q) => q.len(),
        Err(e) => fail(e),
    };

    print!("{}", render_status(&rows, pending));
}

fn cmd_teardown(project: &Path, name: &str) {
    let (config, store, _) = open_state(project);
    let manager = AgentManager::new(project, &config, &store);
    let report = manager.teardown(name);
    if report.is_clean() {
        println!("Tore down {}.", report.name);
    } else {
        println!("Tore down {} with issues:", report.name);
        for err in &report.errors {
            println!("  - {err}");
        }
    }
}
