//! Config subcommand handlers.

use tabled::Tabled;

use sdcp_config::{Config, PrinterProfile};

use crate::cli::{ConfigArgs, ConfigCommand, OutputFormat};
use crate::error::CliError;
use crate::output;

use super::Context;

const REDACTED: &str = "********";

/// Copy of `cfg` safe to print: plaintext access codes are masked.
fn redacted(cfg: &Config) -> Config {
    let mut cfg = cfg.clone();
    for profile in cfg.printers.values_mut() {
        if profile.access_code.is_some() {
            profile.access_code = Some(REDACTED.into());
        }
    }
    cfg
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "Profile")]
    name: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Transport")]
    transport: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Model")]
    model: String,
}

#[derive(serde::Serialize)]
struct NamedProfile<'a> {
    name: &'a str,
    default: bool,
    #[serde(flatten)]
    profile: &'a PrinterProfile,
}

fn profile_row(p: &NamedProfile<'_>) -> ProfileRow {
    ProfileRow {
        name: if p.default {
            format!("{} *", p.name)
        } else {
            p.name.to_owned()
        },
        host: p.profile.host.clone(),
        transport: p.profile.transport.to_string(),
        id: p.profile.id.clone(),
        model: output::or_dash(p.profile.model.as_deref()),
    }
}

pub fn handle(args: ConfigArgs, ctx: &Context) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", ctx.config_path.display());
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = redacted(&ctx.config);
            let rendered = match ctx.output()? {
                OutputFormat::Table => {
                    toml::to_string_pretty(&cfg).map_err(|e| CliError::Render(e.to_string()))?
                }
                OutputFormat::Json => output::render_json(&cfg, false)?,
                OutputFormat::JsonCompact => output::render_json(&cfg, true)?,
                OutputFormat::Yaml => output::render_yaml(&cfg)?,
            };
            ctx.print(&rendered);
            Ok(())
        }

        ConfigCommand::Printers => {
            let cfg = redacted(&ctx.config);
            let default = cfg.default_printer.as_deref();
            let profiles: Vec<NamedProfile<'_>> = cfg
                .printers
                .iter()
                .map(|(name, profile)| NamedProfile {
                    name,
                    default: Some(name.as_str()) == default,
                    profile,
                })
                .collect();
            if profiles.is_empty() {
                ctx.note(&format!(
                    "No printer profiles in {}",
                    ctx.config_path.display()
                ));
            }
            let rendered = output::render_list(ctx.output()?, &profiles, profile_row)?;
            ctx.print(&rendered);
            Ok(())
        }
    }
}
