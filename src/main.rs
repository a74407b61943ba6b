use std::io;
use std::path::PathBuf;
use std::time::Duration;
use clap_complete::{generate, Shell};
use clap::{Args, Parser, Subcommand, CommandFactory};
use colored::Colorize;
use anyhow::{Context, Result};

use sshfwd::{ForwardConfig, ForwardHandle, Forwarder};

mod settings;
use settings::Settings;

#[derive(Parser)]
#[command(name = "sshfwd")]
#[command(about = "Forward a local port to a remote endpoint through ssh")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ForwardOpts {
    /// Remote end point ([user@]host:endpoint)
    remote: String,
    /// Seconds the remote side waits for a connection
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Identity file passed to ssh
    #[arg(short, long)]
    identity: Option<PathBuf>,
    /// Allow ssh to prompt for a password
    #[arg(long)]
    password_prompt: bool,
    /// ssh executable to run
    #[arg(long)]
    ssh: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel and keep it until Ctrl-C
    ///
    /// Examples:
    ///   sshfwd open alice@db.example:5432
    ///   sshfwd open db.example:/var/run/postgresql/.s.PGSQL.5432 -t 60
    Open(ForwardOpts),
    /// Open a tunnel, run a command against it, then close it
    ///
    /// {host} and {port} in the command are replaced with the local end
    /// point, which is also exported as SSHFWD_HOST and SSHFWD_PORT.
    ///
    /// Examples:
    ///   sshfwd run db.example:5432 -- psql -h {host} -p {port} postgres
    Run {
        #[command(flatten)]
        opts: ForwardOpts,
        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the ssh invocation without running it
    #[command(name = "args")]
    DryRun(ForwardOpts),
    /// Show the config file location and effective settings
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Completions { shell } => {
            generate_completions(*shell);
        }
        _ => {
            let settings = Settings::load()?;

            match &cli.command {
                Commands::Open(opts) => {
                    open_forward(&settings, opts).await?;
                }
                Commands::Run { opts, command } => {
                    let code = run_forward(&settings, opts, command).await?;
                    std::process::exit(code);
                }
                Commands::DryRun(opts) => {
                    print_args(&settings, opts)?;
                }
                Commands::Config => {
                    show_config(&settings)?;
                }
                Commands::Completions { .. } => unreachable!(),
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("sshfwd=debug"),
        _ => EnvFilter::new("sshfwd=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(
        shell,
        &mut cmd,
        "sshfwd",
        &mut io::stdout()
    );
}

fn build_config(settings: &Settings, opts: &ForwardOpts) -> Result<(ForwardConfig, Forwarder)> {
    let mut config = ForwardConfig::parse(&opts.remote)
        .context("Invalid remote")?;
    settings.apply(&mut config);

    if let Some(secs) = opts.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(identity) = &opts.identity {
        config.identity_file = Some(identity.clone());
    }
    if opts.password_prompt {
        config.allow_password_prompt = true;
    }
    config.validate().context("Invalid remote")?;

    let mut forwarder = settings.forwarder();
    if let Some(program) = &opts.ssh {
        forwarder = forwarder.program(program);
    }
    Ok((config, forwarder))
}

/// Start the tunnel, giving up if the user hits Ctrl-C first. Dropping the
/// pending forward kills the ssh process it spawned.
async fn start(config: &ForwardConfig, forwarder: &Forwarder) -> Result<Option<ForwardHandle>> {
    println!("{}", format!("Starting SSH tunnel to {}...", config.host).dimmed());

    tokio::select! {
        result = forwarder.forward(config) => {
            let tunnel = result.context("Failed to open port forward")?;
            Ok(Some(tunnel))
        }
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "Cancelled".yellow());
            Ok(None)
        }
    }
}

fn print_ready(config: &ForwardConfig, tunnel: &ForwardHandle) {
    println!("\n{}", "✓ Port forward ready!".green().bold());
    println!("  {} → {}:{}",
             tunnel.local_addr().to_string().cyan(),
             config.host.cyan(),
             config.remote_endpoint.cyan());
    if let Some(pid) = tunnel.pid() {
        println!("  {}: {}", "PID".cyan(), pid);
    }
}

async fn open_forward(settings: &Settings, opts: &ForwardOpts) -> Result<()> {
    let (config, forwarder) = build_config(settings, opts)?;
    let Some(mut tunnel) = start(&config, &forwarder).await? else {
        return Ok(());
    };
    print_ready(&config, &tunnel);
    println!("\n{}", "Press Ctrl-C to close".dimmed());

    tokio::select! {
        status = tunnel.closed() => {
            match status {
                Ok(status) => println!("{}", format!("Tunnel closed ({})", status).yellow()),
                Err(e) => eprintln!("{}", format!("  ⚠ Warning: {}", e).yellow()),
            }
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    tunnel.release().await;
    println!("{}", "✓ Port forward closed".green());
    Ok(())
}

fn substitute(arg: &str, tunnel: &ForwardHandle) -> String {
    arg.replace("{host}", &tunnel.local_addr().ip().to_string())
        .replace("{port}", &tunnel.port().to_string())
}

async fn run_forward(settings: &Settings, opts: &ForwardOpts, command: &[String]) -> Result<i32> {
    let (config, forwarder) = build_config(settings, opts)?;
    let Some(mut tunnel) = start(&config, &forwarder).await? else {
        return Ok(130);
    };
    print_ready(&config, &tunnel);

    let args: Vec<String> = command.iter().map(|a| substitute(a, &tunnel)).collect();
    let status = tokio::process::Command::new(&args[0])
        .args(&args[1..])
        .env("SSHFWD_HOST", tunnel.local_addr().ip().to_string())
        .env("SSHFWD_PORT", tunnel.port().to_string())
        .status()
        .await
        .with_context(|| format!("Failed to run {}", args[0]));

    tunnel.release().await;

    let status = status?;
    if !status.success() {
        eprintln!("{}", format!("✗ {} exited with {}", args[0], status).red());
    }
    Ok(status.code().unwrap_or(1))
}

fn print_args(settings: &Settings, opts: &ForwardOpts) -> Result<()> {
    let (config, forwarder) = build_config(settings, opts)?;
    let port = sshfwd::allocate_free_local_port()
        .context("Failed to allocate a local port")?;

    let args: Vec<String> = sshfwd::ssh_args(&config, port)
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    println!("{} {}", forwarder.program_path().display(), args.join(" "));
    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    let path = Settings::config_path()?;
    let status = if path.exists() { "found".green() } else { "not found, using defaults".yellow() };
    println!("{}: {} ({})", "Config".cyan(), path.display(), status);

    let contents = serde_json::to_string_pretty(settings)
        .context("Failed to serialize config")?;
    println!("{}", contents);
    Ok(())
}
