//! Clap derive structures for the `fleetlink` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// fleetlink -- gateway between print agents and fleet dashboards
#[derive(Debug, Parser)]
#[command(
    name = "fleetlink",
    version,
    about = "Printer fleet gateway with circuit breaking and live status",
    long_about = "Accepts WebSocket connections from in-store print agents and \
        dashboards, routes print commands to the right branch with adaptive \
        timeouts and per-printer circuit breakers, and streams fleet status \
        and alerts to observers.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "FLEETLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log line format (overrides `logging.format`)
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Also write daily-rotated logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway until interrupted
    Serve(ServeArgs),

    /// Connect a simulated print agent to a running gateway
    #[command(alias = "sim")]
    SimulateAgent(SimulateArgs),

    /// Inspect or create the configuration file
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SERVE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address (overrides `server.bind`)
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Do not advertise the gateway over mDNS
    #[arg(long)]
    pub no_mdns: bool,

    /// Service name to register and advertise (overrides `service.name`)
    #[arg(long)]
    pub name: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SIMULATE-AGENT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Gateway WebSocket URL
    #[arg(long, short = 'g', default_value = "ws://127.0.0.1:8787/")]
    pub gateway: String,

    /// Company the agent belongs to
    #[arg(long)]
    pub company: String,

    /// Branch the agent serves
    #[arg(long)]
    pub branch: String,

    /// Device id (random when omitted)
    #[arg(long)]
    pub device: Option<String>,

    /// Number of simulated printers
    #[arg(long, short = 'n', default_value_t = 2)]
    pub printers: u32,

    /// Seconds between status reports and heartbeats
    #[arg(long, default_value_t = 15)]
    pub status_interval: u64,

    /// Fail every test print and job, to exercise circuit breaking
    #[arg(long)]
    pub fail: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration (defaults, file and environment)
    Show,

    /// Write a config file populated with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Check that the resolved configuration is valid
    Check,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  COMPLETIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
