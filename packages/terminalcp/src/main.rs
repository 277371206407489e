use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use terminalcp::cli;
use terminalcp::config::{self, FileConfig, ServerConfig, TermcpConfig};
use terminalcp::manager::TerminalManager;
use terminalcp::server::{self, BindOutcome, IpcServer};

#[derive(Parser)]
#[command(name = "terminalcp")]
#[command(about = "Drive interactive CLI programs in pseudo-terminals over local IPC")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.terminalcp)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Server(ServerArgs),

    /// Start a command in a new terminal and print its id
    Start(StartArgs),

    /// Stop a terminal
    Stop(StopArgs),

    /// Send input to a terminal
    Stdin(StdinArgs),

    /// Read a terminal's output
    Stdout(StdoutArgs),

    /// Resize a terminal
    Resize(ResizeArgs),

    /// List terminals
    List(ListArgs),

    /// Print the daemon's controlling terminal size
    TermSize,

    /// Stop the daemon and all terminals
    KillServer,
}

#[derive(Parser)]
struct ServerArgs {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct StartArgs {
    /// Shell command line to run
    command: String,

    #[arg(long)]
    cols: Option<u16>,

    #[arg(long)]
    rows: Option<u16>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<String>,
}

#[derive(Parser)]
struct StopArgs {
    terminal: String,

    /// SIGKILL immediately instead of SIGTERM with a grace period
    #[arg(short, long)]
    force: bool,
}

#[derive(Parser)]
struct StdinArgs {
    terminal: String,

    /// Text to write, or a key token with --key
    data: String,

    /// Treat data as a key token (e.g. Up, C-c, F5)
    #[arg(short, long)]
    key: bool,
}

#[derive(Parser)]
struct StdoutArgs {
    terminal: String,

    /// Raw byte stream instead of the rendered screen
    #[arg(long)]
    stream: bool,

    /// Last N lines of the stream
    #[arg(long)]
    lines: Option<usize>,

    /// Last N bytes of the stream
    #[arg(long)]
    bytes: Option<usize>,
}

#[derive(Parser)]
struct ResizeArgs {
    terminal: String,
    cols: u16,
    rows: u16,
}

#[derive(Parser)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TermcpConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Server(args) => run_server(args, config).await,
        Commands::Start(args) => {
            cli::start_command(&config, &args.command, args.cols, args.rows, args.cwd).await
        }
        Commands::Stop(args) => cli::stop_command(&config, &args.terminal, args.force).await,
        Commands::Stdin(args) => {
            cli::stdin_command(&config, &args.terminal, &args.data, args.key).await
        }
        Commands::Stdout(args) => {
            cli::stdout_command(&config, &args.terminal, args.stream, args.lines, args.bytes).await
        }
        Commands::Resize(args) => {
            cli::resize_command(&config, &args.terminal, args.cols, args.rows).await
        }
        Commands::List(args) => cli::list_command(&config, args.json).await,
        Commands::TermSize => cli::term_size_command(&config).await,
        Commands::KillServer => cli::kill_server_command(&config).await,
    }
}

async fn run_server(args: ServerArgs, config: TermcpConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "terminalcp=debug,pty_host=debug,info"
    } else {
        "terminalcp=info,pty_host=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config: FileConfig = match config::load_config(&config.data_dir).extract() {
        Ok(fc) => fc,
        Err(e) => {
            warn!("invalid configuration, using defaults: {}", e);
            FileConfig::default()
        }
    };
    let settings = ServerConfig::from_file(&file_config.server);

    info!(
        "starting terminalcp daemon (buffer {}MB, scrollback {} lines)",
        settings.max_buffer_bytes / (1024 * 1024),
        settings.scrollback_lines
    );

    let socket_path = config.socket_path();
    let listener = match server::bind_socket(&socket_path).await {
        Ok(BindOutcome::Bound(listener)) => listener,
        Ok(BindOutcome::AlreadyRunning) => {
            eprintln!(
                "A terminalcp daemon is already running on {:?}.",
                socket_path
            );
            return Ok(());
        }
        Err(e) => {
            eprintln!("Failed to bind {:?}: {:#}", socket_path, e);
            std::process::exit(1);
        }
    };

    let write_queue = settings.write_queue_frames;
    let manager = Arc::new(TerminalManager::new(settings));
    let ipc = Arc::new(IpcServer::new(manager, write_queue));

    // SIGTERM / SIGINT both trigger the graceful shutdown path.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            shutdown.cancel();
        });
    }

    if let Err(e) = ipc.serve(listener, socket_path, shutdown).await {
        eprintln!("Fatal daemon error: {:#}", e);
        std::process::exit(2);
    }

    Ok(())
}
