//! Command dispatch: bridges CLI args -> core commands -> output formatting.

pub mod broker;
pub mod config_cmd;
pub mod control;
pub mod discover;
pub mod gateway;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use tracing::debug;

use sdcp_api::BrokerManager;
use sdcp_config::{Config, PrinterProfile};
use sdcp_core::{Printer, PrinterConfig};

use crate::cli::{Command, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

/// Everything a handler needs: parsed flags and the layered config.
pub struct Context {
    pub global: GlobalOpts,
    pub config: Config,
    pub config_path: PathBuf,
}

impl Context {
    pub fn load(global: GlobalOpts) -> Result<Self, CliError> {
        let config_path = global.config.clone().unwrap_or_else(sdcp_config::config_path);
        let config = sdcp_config::load_config_from(Some(&config_path))
            .map_err(|e| CliError::from_config(e, &config_path))?;
        Ok(Self {
            global,
            config,
            config_path,
        })
    }

    pub fn output(&self) -> Result<OutputFormat, CliError> {
        if let Some(format) = self.global.output {
            return Ok(format);
        }
        OutputFormat::from_str(&self.config.defaults.output, true).map_err(|reason| {
            CliError::Validation {
                field: "defaults.output".into(),
                reason,
            }
        })
    }

    pub fn color(&self) -> bool {
        output::should_color(self.global.color)
    }

    pub fn print(&self, rendered: &str) {
        output::print_output(rendered, self.global.quiet);
    }

    /// Note on stderr unless `--quiet`.
    pub fn note(&self, message: &str) {
        if !self.global.quiet {
            eprintln!("{message}");
        }
    }

    /// The printer named by `--host/--id`, else by `--printer`, else the
    /// configured default.
    pub fn printer_config(&self) -> Result<PrinterConfig, CliError> {
        let mut config = if let (Some(host), Some(id)) = (&self.global.host, &self.global.id) {
            let profile = PrinterProfile {
                host: host.clone(),
                transport: self.global.transport,
                id: id.clone(),
                model: None,
                port: None,
                access_code: self.global.access_code.clone(),
                access_code_env: None,
                command_timeout: None,
            };
            sdcp_config::profile_to_printer_config(&profile, &self.config.defaults)
        } else {
            let (name, profile) = self
                .config
                .select_printer(self.global.printer.as_deref())
                .map_err(|e| CliError::from_config(e, &self.config_path))?;
            debug!(profile = name, host = %profile.host, "using printer profile");
            sdcp_config::profile_to_printer_config(profile, &self.config.defaults)
        };
        if let Some(secs) = self.global.timeout {
            config = config.with_command_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn broker(&self) -> Arc<BrokerManager> {
        Arc::new(BrokerManager::new(self.config.broker.to_broker_config()))
    }

    /// Build and connect the selected printer.
    pub async fn connect(&self) -> Result<Printer, CliError> {
        let printer = Printer::with_broker(self.printer_config()?, self.broker());
        printer.connect().await?;
        Ok(printer)
    }
}

/// Dispatch a parsed command to its handler.
pub async fn dispatch(cmd: Command, ctx: &Context) -> Result<(), CliError> {
    match cmd {
        Command::Discover(args) => discover::handle(args, ctx).await,
        Command::Status(args) => status::status(args, ctx).await,
        Command::Attributes => status::attributes(ctx).await,
        Command::History => status::history(ctx).await,
        Command::Video(args) => control::video(args, ctx).await,
        Command::Pause | Command::Resume | Command::Stop => control::print_control(&cmd, ctx).await,
        Command::Set(args) => control::set(args, ctx).await,
        Command::Gateway(args) => gateway::handle(args, ctx).await,
        Command::Broker(args) => broker::handle(args, ctx).await,
        Command::Config(args) => config_cmd::handle(args, ctx),
        // Handled before dispatch
        Command::Completions(_) => Ok(()),
    }
}
