//! Standalone broker daemon handler.

use tracing::info;

use sdcp_api::BrokerHandle;

use crate::cli::BrokerArgs;
use crate::error::CliError;

use super::Context;

pub async fn handle(args: BrokerArgs, ctx: &Context) -> Result<(), CliError> {
    let mut config = ctx.config.broker.to_broker_config();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let broker = BrokerHandle::start(&config).await?;
    ctx.note(&format!("MQTT broker listening on {}", broker.local_addr()));

    tokio::signal::ctrl_c().await?;
    info!(sessions = broker.session_count(), "interrupt received, stopping broker");
    Ok(())
}
