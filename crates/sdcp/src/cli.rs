//! Clap derive structures for the `sdcp` CLI.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use sdcp_core::{Fan, TransportKind};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// sdcp -- talk to ELEGOO SDCP printers from the command line
#[derive(Debug, Parser)]
#[command(
    name = "sdcp",
    version,
    about = "Discover, monitor and control SDCP printers",
    long_about = "Discover, monitor and control resin and FDM printers that speak SDCP\n\
        over WebSocket or MQTT, or JSON-RPC over the printer's own MQTT broker.\n\n\
        Also runs a multi-printer gateway and a standalone MQTT broker.",
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
    #[arg(long, env = "SDCP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Printer profile to use
    #[arg(long, short = 'p', env = "SDCP_PRINTER", global = true)]
    pub printer: Option<String>,

    /// Printer address (bypasses profiles; requires --id)
    #[arg(long, global = true, requires = "id")]
    pub host: Option<String>,

    /// Mainboard id or serial number for --host
    #[arg(long, global = true)]
    pub id: Option<String>,

    /// Transport for --host
    #[arg(long, global = true, default_value = "websocket")]
    pub transport: TransportKind,

    /// Access code for --host on inverted-MQTT printers
    #[arg(long, env = "SDCP_ACCESS_CODE", global = true, hide_env_values = true)]
    pub access_code: Option<String>,

    /// Output format (defaults to `defaults.output` from config)
    #[arg(long, short = 'o', env = "SDCP_OUTPUT", global = true)]
    pub output: Option<OutputFormat>,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Command timeout in seconds (overrides config)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Find printers on the local network
    #[command(alias = "scan")]
    Discover(DiscoverArgs),

    /// Show the printer's current status
    #[command(alias = "st")]
    Status(StatusArgs),

    /// Show the printer's attributes (model, firmware, capabilities)
    #[command(alias = "attrs")]
    Attributes,

    /// List past print jobs
    History,

    /// Enable or disable the camera stream
    Video(VideoArgs),

    /// Pause the running print
    Pause,

    /// Resume a paused print
    Resume,

    /// Stop the running print
    Stop,

    /// Change a printer parameter
    Set(SetArgs),

    /// Run the multi-printer gateway
    #[command(alias = "proxy")]
    Gateway(GatewayArgs),

    /// Run a standalone MQTT broker for SDCP-over-MQTT printers
    Broker(BrokerArgs),

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Discover ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// Seconds to wait for replies (overrides config)
    #[arg(long, short = 't')]
    pub wait: Option<u64>,

    /// Probe this address instead of broadcasting
    #[arg(long)]
    pub target: Option<IpAddr>,

    /// Skip the SDCP probe
    #[arg(long)]
    pub no_sdcp: bool,

    /// Skip the inverted-MQTT probe
    #[arg(long)]
    pub no_cc2: bool,
}

// ── Status ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Keep printing every status push until interrupted
    #[arg(long, short = 'w')]
    pub watch: bool,
}

// ── Video ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct VideoArgs {
    #[command(subcommand)]
    pub command: VideoCommand,
}

#[derive(Debug, Subcommand)]
pub enum VideoCommand {
    /// Start the stream and print its URL
    Enable,
    /// Stop the stream
    Disable,
}

// ── Set ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SetArgs {
    #[command(subcommand)]
    pub command: SetCommand,
}

#[derive(Debug, Subcommand)]
pub enum SetCommand {
    /// Fan speed in percent (model, auxiliary, box)
    Fan { fan: Fan, percent: u32 },
    /// Print speed in percent
    Speed { percent: u32 },
    /// Nozzle target temperature in °C
    Nozzle { celsius: f64 },
    /// Bed target temperature in °C
    Bed { celsius: f64 },
    /// Chamber light
    Light { state: Toggle },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

// ── Gateway ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GatewayArgs {
    /// HTTP and WebSocket port (overrides config)
    #[arg(long)]
    pub http_port: Option<u16>,

    /// MJPEG video port (overrides config)
    #[arg(long)]
    pub video_port: Option<u16>,

    /// Host name clients use to reach the gateway (overrides config)
    #[arg(long)]
    pub external_host: Option<String>,

    /// Don't register printers found by discovery at start-up
    #[arg(long)]
    pub no_discover: bool,

    /// Exit once the last printer is unregistered
    #[arg(long)]
    pub shutdown_when_empty: bool,
}

// ── Broker ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct BrokerArgs {
    /// Listen port (overrides config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(long)]
    pub bind: Option<IpAddr>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// List printer profiles
    Printers,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    pub shell: clap_complete::Shell,
}
