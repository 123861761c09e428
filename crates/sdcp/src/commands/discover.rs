//! Discover command handler.

use std::time::Duration;

use tabled::Tabled;

use sdcp_api::{DiscoveredDevice, DiscoveryConfig, discover};
use sdcp_core::{PrinterClass, TransportKind};

use crate::cli::DiscoverArgs;
use crate::error::CliError;
use crate::output;

use super::Context;

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Transport")]
    transport: String,
    #[tabled(rename = "Class")]
    class: String,
    #[tabled(rename = "Firmware")]
    firmware: String,
}

fn device_row(d: &DiscoveredDevice) -> DeviceRow {
    DeviceRow {
        id: d.id.clone(),
        name: d.name.clone(),
        model: d.model.clone(),
        address: d.address.to_string(),
        transport: TransportKind::from(d.transport).to_string(),
        class: PrinterClass::from_model(&d.model).to_string(),
        firmware: output::or_dash(d.firmware_version.as_deref()),
    }
}

pub async fn handle(args: DiscoverArgs, ctx: &Context) -> Result<(), CliError> {
    let mut config = DiscoveryConfig {
        timeout: Duration::from_secs(args.wait.unwrap_or(ctx.config.defaults.discovery_timeout)),
        sdcp: !args.no_sdcp,
        cc2: !args.no_cc2,
        ..DiscoveryConfig::default()
    };
    if let Some(target) = args.target {
        config.target = target;
    }
    if !config.sdcp && !config.cc2 {
        return Err(CliError::Validation {
            field: "discover".into(),
            reason: "--no-sdcp and --no-cc2 leave nothing to probe".into(),
        });
    }

    let devices = discover(config).await.map_err(sdcp_core::CoreError::from)?;
    if devices.is_empty() {
        ctx.note("No printers answered.");
    }
    let rendered = output::render_list(ctx.output()?, &devices, device_row)?;
    ctx.print(&rendered);
    Ok(())
}
