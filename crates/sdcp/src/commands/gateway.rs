//! Gateway daemon handler.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sdcp_api::DiscoveryConfig;
use sdcp_config::GatewaySettings;
use sdcp_gateway::{Gateway, GatewayConfig};

use crate::cli::GatewayArgs;
use crate::error::CliError;

use super::Context;

fn gateway_config(settings: &GatewaySettings, args: &GatewayArgs) -> GatewayConfig {
    GatewayConfig {
        bind: settings.bind,
        http_port: args.http_port.unwrap_or(settings.http_port),
        video_port: args.video_port.unwrap_or(settings.video_port),
        discovery_port: settings.discovery_port,
        external_host: args
            .external_host
            .clone()
            .or_else(|| settings.external_host.clone()),
        rate_limit: Duration::from_secs(settings.rate_limit_secs),
        shutdown_when_empty: args.shutdown_when_empty || settings.shutdown_when_empty,
        ..GatewayConfig::default()
    }
}

pub async fn handle(args: GatewayArgs, ctx: &Context) -> Result<(), CliError> {
    let settings = &ctx.config.gateway;
    let gateway = Gateway::new(gateway_config(settings, &args), ctx.broker())?;

    for (name, profile) in &ctx.config.printers {
        let config = sdcp_config::profile_to_printer_config(profile, &ctx.config.defaults);
        if let Err(e) = gateway.register(config).await {
            warn!(profile = %name, host = %profile.host, error = %e, "printer not registered");
        }
    }

    if settings.auto_discover && !args.no_discover {
        let discovery = DiscoveryConfig {
            timeout: Duration::from_secs(ctx.config.defaults.discovery_timeout),
            ..DiscoveryConfig::default()
        };
        match gateway.register_discovered(discovery).await {
            Ok(added) => info!(added, "registered discovered printers"),
            Err(e) => warn!(error = %e, "discovery failed"),
        }
    }

    if gateway.registry().is_empty() {
        warn!("no printers registered; add some with POST /api/printers");
    }
    ctx.note(&format!(
        "Gateway serving {} printer(s) at http://{}:{}",
        gateway.registry().len(),
        gateway.public_address().host,
        gateway.config().http_port
    ));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        on_signal.cancel();
    });

    gateway.run(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let settings = GatewaySettings {
            external_host: Some("from-config.lan".into()),
            ..GatewaySettings::default()
        };
        let args = GatewayArgs {
            http_port: Some(8080),
            video_port: None,
            external_host: None,
            no_discover: true,
            shutdown_when_empty: true,
        };
        let config = gateway_config(&settings, &args);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.video_port, 3031);
        assert_eq!(config.external_host.as_deref(), Some("from-config.lan"));
        assert!(config.shutdown_when_empty);
        assert_eq!(config.rate_limit, Duration::from_secs(30));
    }
}
