//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError`, `ConfigError` and `GatewayError` into user-facing
//! errors with help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use sdcp_config::ConfigError;
use sdcp_core::CoreError;
use sdcp_gateway::GatewayError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
    pub const REGISTRATION: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to printer at {host}")]
    #[diagnostic(
        code(sdcp::connection_failed),
        help(
            "Check that the printer is powered on and on the same network.\n\
             Reason: {reason}\n\
             Try: sdcp discover"
        )
    )]
    ConnectionFailed { host: String, reason: String },

    #[error("Printer connection lost: {reason}")]
    #[diagnostic(code(sdcp::connection_lost))]
    ConnectionLost { reason: String },

    #[error("Printer refused registration: {reason}")]
    #[diagnostic(
        code(sdcp::registration),
        help(
            "The printer limits how many clients may attach at once.\n\
             Close the vendor app or other sessions and try again."
        )
    )]
    Registration { reason: String },

    #[error("Printer did not answer within {timeout_ms}ms")]
    #[diagnostic(
        code(sdcp::timeout),
        help("Increase the timeout with --timeout or check the printer is responsive.")
    )]
    Timeout { timeout_ms: u64 },

    // ── Operations ───────────────────────────────────────────────────
    #[error("Printer rejected {command} (ack {ack})")]
    #[diagnostic(
        code(sdcp::rejected),
        help("The printer may be busy or the command does not apply in its current state.")
    )]
    Rejected { command: String, ack: i64 },

    #[error("{operation} is not supported over {transport}")]
    #[diagnostic(code(sdcp::unsupported))]
    Unsupported { operation: String, transport: String },

    #[error("Printer has not reported {what} yet")]
    #[diagnostic(code(sdcp::no_data))]
    NoData { what: String },

    #[error("Printer error: {message}")]
    #[diagnostic(code(sdcp::printer))]
    Printer { message: String },

    // ── Lookup ───────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(code(sdcp::not_found), help("Run: sdcp {list_command}"))]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("No printer selected")]
    #[diagnostic(
        code(sdcp::no_printer),
        help(
            "Pass --printer <name>, set default_printer in {path},\n\
             or address one directly with --host <addr> --id <mainboard id>."
        )
    )]
    NoPrinterSelected { path: String },

    // ── Validation / configuration ───────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(sdcp::validation))]
    Validation { field: String, reason: String },

    #[error("Configuration error: {source}")]
    #[diagnostic(code(sdcp::config), help("Check the config file: {path}"))]
    Config {
        #[source]
        source: ConfigError,
        path: String,
    },

    // ── Daemons ──────────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(sdcp::gateway))]
    Gateway(GatewayError),

    #[error(transparent)]
    #[diagnostic(code(sdcp::broker))]
    Broker(#[from] sdcp_api::Error),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    #[diagnostic(code(sdcp::output))]
    Render(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::ConnectionLost { .. } => exit_code::CONNECTION,
            Self::Registration { .. } => exit_code::REGISTRATION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } | Self::NoPrinterSelected { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotConnected => Self::ConnectionLost {
                reason: "not connected".into(),
            },
            CoreError::ConnectionFailed { host, reason } => Self::ConnectionFailed { host, reason },
            CoreError::ConnectionLost { reason } => Self::ConnectionLost { reason },
            CoreError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            CoreError::TooManyClients => Self::Registration {
                reason: "too many clients".into(),
            },
            CoreError::RegistrationRejected { reason } => Self::Registration { reason },
            CoreError::Rejected { command, ack } => Self::Rejected { command, ack },
            CoreError::Unsupported {
                operation,
                transport,
            } => Self::Unsupported {
                operation,
                transport,
            },
            CoreError::DeviceNotFound { identifier } => Self::NotFound {
                resource_type: "printer".into(),
                identifier,
                list_command: "discover".into(),
            },
            CoreError::Config { message } => Self::Validation {
                field: "printer".into(),
                reason: message,
            },
            CoreError::Malformed { message }
            | CoreError::Discovery { message }
            | CoreError::Internal(message) => Self::Printer { message },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl CliError {
    pub fn from_config(err: ConfigError, path: &std::path::Path) -> Self {
        let path = path.display().to_string();
        match err {
            ConfigError::UnknownPrinter { name } => Self::NotFound {
                resource_type: "printer profile".into(),
                identifier: name,
                list_command: "config printers".into(),
            },
            ConfigError::NoPrinterSelected => Self::NoPrinterSelected { path },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            source => Self::Config { source, path },
        }
    }
}

impl From<GatewayError> for CliError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Core(core) => core.into(),
            GatewayError::UnknownPrinter { id } => Self::NotFound {
                resource_type: "printer".into(),
                identifier: id,
                list_command: "discover".into(),
            },
            other => Self::Gateway(other),
        }
    }
}
