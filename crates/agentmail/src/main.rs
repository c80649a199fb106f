use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use agentmail::watcher::{WatchOptions, Watcher};
use agentmail::{client, config_store, daemon};
use agentmail_core::access::check_read;
use agentmail_core::config::{ConfigFile, Endpoint};
use agentmail_core::cursor::Cursor;
use agentmail_core::message::{rfc3339, Body, Mailbox, Message};
use agentmail_core::paths::{compute_paths, MailPaths, PathInputs};
use agentmail_core::registry::AgentRegistry;
use agentmail_core::store::MessageStore;
use agentmail_core::MailError;
use agentmail_protocol::{AgentRegisterRequest, SendRequest};
use anyhow::{anyhow, Context as _};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use directories::BaseDirs;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "am",
    version,
    about = "Agent Mail: mailboxes, live watch and relay for cooperating agents"
)]
struct Cli {
    #[arg(long = "dir", global = true, value_name = "DIR", env = "AGENTMAIL_DIR")]
    base_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH", env = "AGENTMAIL_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR", env = "AGENTMAIL_MAIL_DIR")]
    mail_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "AGENTMAIL_LOG", value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(hide = true)]
    Ping,
    /// Send a message to a topic or to `@agent`.
    Send(SendArgs),
    /// Stream new messages as they arrive.
    Watch(WatchArgs),
    /// Print the messages stored in one mailbox.
    Read(ReadArgs),
    /// List every mailbox that holds mail.
    Mailboxes,
    /// List known agents and whether they are online.
    Agents,
    /// Register an agent, optionally setting its status line.
    Register {
        name: String,
        #[arg(long)]
        status: Option<String>,
    },
    /// Delete old messages.
    Gc {
        #[arg(long)]
        days: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
    Version,
    Completion {
        #[command(subcommand)]
        command: CompletionCommand,
    },
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, env = "AGENTMAIL_AGENT")]
    from: String,
    /// Topic name, or `@agent` for a direct message.
    to: String,
    /// Message body. Valid non-string JSON is sent structured.
    body: String,
    #[arg(long)]
    reply_to: Option<String>,
    #[arg(long)]
    priority: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Topic, `@agent`, or `*`. Empty watches the agent's inbox, or every
    /// topic when no agent is given.
    #[arg(default_value = "")]
    target: String,
    #[arg(long, env = "AGENTMAIL_AGENT")]
    agent: Option<String>,
    #[arg(long)]
    since_id: Option<String>,
    #[arg(long)]
    since_time: Option<String>,
    /// Replay the full backlog before streaming.
    #[arg(long)]
    all: bool,
    /// Exit after this many messages.
    #[arg(long)]
    count: Option<usize>,
    /// Exit after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long)]
    allow_dm: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReadArgs {
    mailbox: String,
    #[arg(long, env = "AGENTMAIL_AGENT")]
    agent: Option<String>,
    #[arg(long)]
    since_id: Option<String>,
    #[arg(long)]
    since_time: Option<String>,
    #[arg(long)]
    allow_dm: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum CompletionCommand {
    Bash,
    Fish,
    Powershell,
    Zsh,
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    Start {
        #[arg(short = 'f', long)]
        foreground: bool,
    },
    Status,
    #[command(alias = "shutdown")]
    Stop,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths(
        cli.base_dir.as_ref(),
        cli.socket_path.as_ref(),
        cli.mail_dir.as_ref(),
    )?;
    let enable_stderr_logging = !matches!(cli.command, Command::Completion { .. });
    init_logging(&paths, cli.log_level.as_deref(), enable_stderr_logging)?;

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "agentmail starting");

    dispatch(cli.command, &paths).await
}

fn resolve_paths(
    base_dir_override: Option<&PathBuf>,
    socket_path_override: Option<&PathBuf>,
    mail_dir_override: Option<&PathBuf>,
) -> anyhow::Result<MailPaths> {
    let base_dirs = BaseDirs::new().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let home_dir = base_dirs.home_dir().to_path_buf();

    let xdg_config_home = match env::var_os("XDG_CONFIG_HOME") {
        Some(v) => Some(PathBuf::from(v)),
        None => Some(base_dirs.config_dir().to_path_buf()),
    };

    let base_dir_override = base_dir_override
        .cloned()
        .or_else(|| env::var_os("AGENTMAIL_DIR").map(PathBuf::from));
    let socket_path_override = socket_path_override
        .cloned()
        .or_else(|| env::var_os("AGENTMAIL_SOCKET_PATH").map(PathBuf::from));
    let mail_dir_override = mail_dir_override
        .cloned()
        .or_else(|| env::var_os("AGENTMAIL_MAIL_DIR").map(PathBuf::from));

    Ok(compute_paths(PathInputs {
        home_dir,
        xdg_config_home,
        base_dir_override,
        socket_path_override,
        mail_dir_override,
    }))
}

fn init_logging(
    paths: &MailPaths,
    log_level: Option<&str>,
    enable_stderr_logging: bool,
) -> anyhow::Result<()> {
    let dir_ok = fs::create_dir_all(&paths.base_dir).is_ok();

    let env_level = env::var("RUST_LOG").ok();
    let level = log_level
        .map(str::to_owned)
        .or_else(|| env::var("AGENTMAIL_LOG").ok())
        .or(env_level)
        .unwrap_or_else(|| "info".to_owned());

    let filter = EnvFilter::try_new(level).context("parse log level")?;

    let file_layer = if dir_ok {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::NEVER)
            .filename_prefix("agentmail")
            .filename_suffix("log")
            .build(&paths.base_dir)
            .ok()
            .map(|file_appender| {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_appender)
            })
    } else {
        None
    };

    let stderr_layer = enable_stderr_logging.then(|| {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

async fn dispatch(command: Command, paths: &MailPaths) -> anyhow::Result<()> {
    match command {
        Command::Ping => ping(paths).await,
        Command::Send(args) => send(paths, args).await,
        Command::Watch(args) => watch(paths, args).await,
        Command::Read(args) => read(paths, args).await,
        Command::Mailboxes => mailboxes(paths).await,
        Command::Agents => agents(paths).await,
        Command::Register { name, status } => register(paths, name, status).await,
        Command::Gc { days, dry_run } => gc(paths, days, dry_run).await,
        Command::Version => version(),
        Command::Completion { command } => completion(command),
        Command::Server { command } => dispatch_server(command, paths).await,
    }
}

fn completion(command: CompletionCommand) -> anyhow::Result<()> {
    let shell = match command {
        CompletionCommand::Bash => Shell::Bash,
        CompletionCommand::Fish => Shell::Fish,
        CompletionCommand::Powershell => Shell::PowerShell,
        CompletionCommand::Zsh => Shell::Zsh,
    };

    let mut cmd = Cli::command();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, "am", &mut buf);
    match io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write completion script to stdout"),
    }
}

async fn dispatch_server(command: ServerCommand, paths: &MailPaths) -> anyhow::Result<()> {
    match command {
        ServerCommand::Start { foreground } => server_start(foreground, paths).await,
        ServerCommand::Status => server_status(paths).await,
        ServerCommand::Stop => server_shutdown(paths).await,
    }
}

async fn server_start(foreground: bool, paths: &MailPaths) -> anyhow::Result<()> {
    if foreground {
        return daemon::run_foreground(paths).await;
    }

    let endpoints = local_endpoint(paths);
    if paths.socket_path.exists() && client::ping(&endpoints).await.is_ok() {
        println!("running");
        return Ok(());
    }

    let exe = std::env::current_exe().context("get current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.args(["server", "start", "--foreground"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // The child must resolve the same locations even when this process got
    // them from flags rather than the environment.
    cmd.env("AGENTMAIL_SOCKET_PATH", &paths.socket_path);
    cmd.env("AGENTMAIL_MAIL_DIR", &paths.mail_dir);
    if paths.config_dir == paths.base_dir.join("config") {
        cmd.env("AGENTMAIL_DIR", &paths.base_dir);
    }

    let child = cmd.spawn().context("spawn daemon")?;
    let pid = child.id();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timed out waiting for daemon to start (pid {pid})"));
        }
        if client::ping(&endpoints).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("{pid}");
    Ok(())
}

async fn server_status(paths: &MailPaths) -> anyhow::Result<()> {
    let running = if !paths.socket_path.exists() {
        false
    } else {
        client::ping(&local_endpoint(paths)).await.is_ok()
    };

    println!("{}", if running { "running" } else { "stopped" });
    tracing::debug!(
        running,
        socket = %paths.socket_path.display(),
        "server status"
    );
    Ok(())
}

async fn server_shutdown(paths: &MailPaths) -> anyhow::Result<()> {
    client::shutdown(&local_endpoint(paths)).await?;
    println!("ok");
    Ok(())
}

async fn ping(paths: &MailPaths) -> anyhow::Result<()> {
    let config = config_store::load(paths).await?;
    let resp = client::ping(&client::endpoints(paths, &config)).await?;
    println!("ok\t{}\tpid {}", resp.project_id, resp.pid);
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

async fn send(paths: &MailPaths, args: SendArgs) -> anyhow::Result<()> {
    let config = config_store::load(paths).await?;
    let from = args.from.trim().to_owned();

    let host = hostname();
    let body = Body::parse(&args.body);
    let req = SendRequest {
        from: from.clone(),
        to: args.to.clone(),
        body: body.to_value(),
        reply_to: args.reply_to.clone(),
        priority: args.priority.clone(),
        host: host.clone(),
    };

    let id = match client::send(&client::endpoints(paths, &config), req).await {
        Ok(Some(resp)) => resp.id,
        Ok(None) => {
            tracing::debug!("no daemon; writing to the store directly");
            let store = MessageStore::open(&paths.mail_dir)
                .with_max_body_bytes(config.store.effective_max_body_bytes());
            let msg = Message::new(from.clone(), args.to, body)
                .with_reply_to(args.reply_to)
                .with_priority(args.priority);
            let saved = store.save(msg)?;
            if let Err(err) = AgentRegistry::new(&paths.mail_dir).ensure(&from, &host) {
                tracing::warn!(agent = %from, error = %err, "failed to record sender presence");
            }
            saved.id
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context("daemon did not confirm the send; the message may have been delivered"))
        }
    };

    println!("{id}");
    Ok(())
}

async fn watch(paths: &MailPaths, args: WatchArgs) -> anyhow::Result<()> {
    let config = config_store::load(paths).await?;

    let mut opts = WatchOptions::new(args.target, &config.watch);
    opts.agent = args.agent;
    opts.allow_dm = args.allow_dm;
    opts.since = Cursor::from_parts(args.since_id.as_deref(), args.since_time.as_deref())?;
    opts.replay_all = args.all;
    opts.max_messages = args.count.filter(|n| *n > 0);
    opts.timeout = args.timeout_secs.map(Duration::from_secs);
    opts.host = hostname();

    let store = MessageStore::open(&paths.mail_dir);
    let watcher = Watcher::new(opts, client::endpoints(paths, &config), store)?;

    let (tx, mut rx) = mpsc::channel(64);
    let task = tokio::spawn(watcher.run(tx));

    let stdout = io::stdout();
    while let Some(msg) = rx.recv().await {
        let mut out = stdout.lock();
        let written = print_message(&mut out, &msg, args.json).and_then(|()| out.flush());
        match written {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => break,
            Err(err) => return Err(err).context("write message to stdout"),
        }
    }
    drop(rx);

    let end = task.await.context("watch task panicked")??;
    tracing::debug!(?end, "watch finished");
    Ok(())
}

async fn read(paths: &MailPaths, args: ReadArgs) -> anyhow::Result<()> {
    let mailbox = Mailbox::parse(&args.mailbox)?;
    let agent = args.agent.as_deref().map(str::trim).filter(|a| !a.is_empty());
    check_read(agent, &mailbox, args.allow_dm)?;

    let cursor = Cursor::from_parts(args.since_id.as_deref(), args.since_time.as_deref())?;
    let store = MessageStore::open(&paths.mail_dir);
    let messages = store.list_since(&mailbox, cursor.as_ref())?;

    let mut stdout = io::stdout().lock();
    for msg in &messages {
        print_message(&mut stdout, msg, args.json).context("write message to stdout")?;
    }
    Ok(())
}

async fn mailboxes(paths: &MailPaths) -> anyhow::Result<()> {
    let store = MessageStore::open(&paths.mail_dir);
    let mailboxes = store.mailboxes()?;
    if mailboxes.is_empty() {
        println!("No mailboxes");
        return Ok(());
    }
    for mailbox in mailboxes {
        let count = store.list_ids(&mailbox)?.len();
        println!("{mailbox}\t{count}");
    }
    Ok(())
}

async fn agents(paths: &MailPaths) -> anyhow::Result<()> {
    let config = config_store::load(paths).await?;
    let agents = match client::agent_list(&client::endpoints(paths, &config)).await {
        Ok(resp) => resp.agents,
        Err(err) if daemon_unreachable(&err) => {
            let now = OffsetDateTime::now_utc();
            let stale = config.effective_agent_stale();
            AgentRegistry::new(&paths.mail_dir)
                .list()?
                .iter()
                .map(|r| agentmail::proto::agent_info(r, now, stale))
                .collect()
        }
        Err(err) => return Err(err),
    };

    if agents.is_empty() {
        println!("No agents");
        return Ok(());
    }
    for a in agents {
        let state = if a.online { "online" } else { "offline" };
        let status = a.status.as_deref().unwrap_or("");
        println!("{}\t{}\t{}\t{}\t{}", a.name, state, a.host, a.last_seen, status);
    }
    Ok(())
}

async fn register(paths: &MailPaths, name: String, status: Option<String>) -> anyhow::Result<()> {
    let config = config_store::load(paths).await?;
    let name = name.trim().to_owned();
    let req = AgentRegisterRequest {
        name: name.clone(),
        host: hostname(),
        status: status.clone(),
    };

    match client::agent_register(&client::endpoints(paths, &config), req).await {
        Ok(_) => {}
        Err(err) if daemon_unreachable(&err) => {
            let registry = AgentRegistry::new(&paths.mail_dir);
            registry.ensure(&name, &hostname())?;
            if status.is_some() {
                registry.set_status(&name, status)?;
            }
        }
        Err(err) => return Err(err),
    }

    println!("{name}");
    Ok(())
}

async fn gc(paths: &MailPaths, days: Option<u64>, dry_run: bool) -> anyhow::Result<()> {
    let config = config_store::load(paths).await?;
    let days = days.unwrap_or_else(|| config.store.effective_gc_max_age_days());
    let cutoff = OffsetDateTime::now_utc() - time::Duration::days(days as i64);

    let store = MessageStore::open(&paths.mail_dir);
    let affected = store.gc(cutoff, dry_run)?;
    for path in &affected {
        println!("{}", path.display());
    }
    tracing::info!(
        removed = affected.len(),
        dry_run,
        cutoff = %rfc3339::format(cutoff),
        "gc finished"
    );
    Ok(())
}

fn local_endpoint(paths: &MailPaths) -> Vec<Endpoint> {
    client::endpoints(paths, &ConfigFile::default())
}

fn daemon_unreachable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MailError>()
        .is_some_and(|e| matches!(e, MailError::Transport(_)))
}

fn print_message(out: &mut impl io::Write, msg: &Message, json: bool) -> io::Result<()> {
    if json {
        let line = serde_json::to_string(msg).map_err(io::Error::other)?;
        return writeln!(out, "{line}");
    }
    writeln!(
        out,
        "{}\t{}\t{} -> {}\t{}",
        msg.id,
        rfc3339::format(msg.time),
        msg.from,
        msg.to,
        msg.body
    )
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
