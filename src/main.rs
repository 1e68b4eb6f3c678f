//! tunwall - VPN gateway kill-switch
//!
//! # Usage
//!
//! ```bash
//! tunwall engines                        # Detect iptables binaries
//! tunwall run --config gateway.json      # Enable until interrupted, then restore
//! tunwall dry-run --config gateway.json  # Print the resulting rules, kernel untouched
//! tunwall dry-run --no-ipv6-nat          # Same, emulating a kernel without IPv6 NAT
//! tunwall audit -n 50                    # Show recent enable/disable events
//! ```
//!
//! `run` keeps the rules in place until SIGINT. Interrupting an enable that is
//! still in progress rolls back whatever it had installed.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunwall::audit::AuditLog;
use tunwall::core::error::IptablesErrorPattern;
use tunwall::{AddressFamily, Firewall, Iptables, MemoryEngine, SystemRunner, config};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "tunwall")]
#[command(about = "Default-deny iptables firewall for VPN client gateways", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Log every engine command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the iptables binaries and print their version
    Engines,
    /// Enable the kill-switch and keep it up until interrupted
    Run {
        /// Gateway configuration file (default: config.json in the config directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Do not write enable/disable events to the audit log
        #[arg(long)]
        no_audit: bool,
    },
    /// Print the rules an enable would install, using an in-memory engine
    DryRun {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Emulate a host without ip6tables
        #[arg(long)]
        no_ipv6: bool,
        /// Emulate a kernel without the IPv6 nat table
        #[arg(long)]
        no_ipv6_nat: bool,
    },
    /// Show recent audit log entries
    Audit {
        /// Number of entries, most recent first
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let _ = tunwall::utils::ensure_dirs();
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            let translation = IptablesErrorPattern::match_error(&e.to_string());
            for suggestion in &translation.suggestions {
                eprintln!("  - {suggestion}");
            }
            if let Some(url) = translation.help_url {
                eprintln!("  See {url}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(command: Commands) -> tunwall::Result<()> {
    match command {
        Commands::Engines => {
            let cancel = CancellationToken::new();
            let iptables = Iptables::new(Arc::new(SystemRunner), &cancel).await?;
            println!("IPv4: {}", iptables.ipv4_binary());
            println!("IPv6: {}", iptables.ipv6_binary().unwrap_or("not supported"));
            println!("Version: {}", iptables.version(&cancel).await?);
        }
        Commands::Run { config, no_audit } => run(config, no_audit).await?,
        Commands::DryRun {
            config,
            no_ipv6,
            no_ipv6_nat,
        } => {
            let config = config::load_config(config.as_deref()).await?;
            let mut engine = MemoryEngine::new();
            if no_ipv6 {
                engine = engine.without_ipv6();
            } else if no_ipv6_nat {
                engine = engine.without_ipv6_nat();
            }
            let engine = Arc::new(engine);

            let cancel = CancellationToken::new();
            let firewall = Firewall::new(
                engine.clone(),
                Arc::new(config.routing()),
                &config.firewall.post_rules_path,
                &cancel,
            )
            .await?;
            config.seed_firewall(&firewall, &cancel).await?;
            firewall.set_enabled(true, &cancel).await?;

            for family in [AddressFamily::V4, AddressFamily::V6] {
                if let Some(dump) = engine.dump(family) {
                    println!("# {family}");
                    print!("{dump}");
                }
            }
        }
        Commands::Audit { count } => {
            let audit = AuditLog::new()?;
            for event in audit.read_recent(count).await? {
                let status = if event.success { "ok" } else { "FAILED" };
                print!(
                    "{} {:?} {status}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type
                );
                match event.error {
                    Some(error) => println!(": {error}"),
                    None => println!(),
                }
            }
        }
    }
    Ok(())
}

async fn run(config: Option<PathBuf>, no_audit: bool) -> tunwall::Result<()> {
    let config = config::load_config(config.as_deref()).await?;

    if !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. Will use sudo/pkexec for iptables.");
    }

    // SIGINT cancels an in-flight enable, which then rolls back on its own
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut firewall = Firewall::new(
        Arc::new(SystemRunner),
        Arc::new(config.routing()),
        &config.firewall.post_rules_path,
        &cancel,
    )
    .await?;
    if !no_audit {
        match AuditLog::new() {
            Ok(audit) => firewall = firewall.with_audit_log(audit),
            Err(e) => warn!("audit log disabled: {e}"),
        }
    }

    config.seed_firewall(&firewall, &cancel).await?;
    firewall.set_enabled(true, &cancel).await?;
    println!("✓ Kill-switch enabled. Press Ctrl+C to disable.");

    cancel.cancelled().await;
    info!("interrupted, restoring previous rules");
    firewall
        .set_enabled(false, &CancellationToken::new())
        .await?;
    println!("✓ Previous rules restored.");
    Ok(())
}
