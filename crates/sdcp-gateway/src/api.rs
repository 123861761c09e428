// ── Management REST API ──
//
// Transport-agnostic access to every registered printer, including
// inverted-MQTT printers whose native protocol can't be byte-forwarded.
//
//   GET    /api/printers                  list
//   POST   /api/printers                  connect + register
//   DELETE /api/printers/{id}             disconnect + unregister
//   GET    /api/printers/{id}/status      latest status snapshot (or null)
//   GET    /api/printers/{id}/attributes  latest attributes (or null)
//   GET    /api/printers/{id}/history     known print history
//   POST   /api/printers/{id}/command     execute a typed command

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use sdcp_core::{
    Attributes, Command, CommandResult, ConnectionState, Device, PrintHistoryEntry, Printer,
    PrinterClass, PrinterConfig, StatusSnapshot, TransportKind,
};

use crate::error::GatewayError;
use crate::server::Gateway;

pub(crate) fn routes() -> Router<Gateway> {
    Router::new()
        .route("/api/printers", get(list_printers).post(register_printer))
        .route("/api/printers/{id}", axum::routing::delete(unregister_printer))
        .route("/api/printers/{id}/status", get(printer_status))
        .route("/api/printers/{id}/attributes", get(printer_attributes))
        .route("/api/printers/{id}/history", get(printer_history))
        .route("/api/printers/{id}/command", post(printer_command))
}

// ── DTOs ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PrinterSummary {
    pub id: String,
    pub name: String,
    pub model: String,
    pub host: String,
    pub transport: TransportKind,
    pub class: PrinterClass,
    pub state: ConnectionState,
}

impl From<&Printer> for PrinterSummary {
    fn from(printer: &Printer) -> Self {
        let device = printer.device();
        Self {
            id: device.id.clone(),
            name: device.display_name().to_owned(),
            model: device.model.clone(),
            host: device.host.clone(),
            transport: device.transport,
            class: device.class,
            state: *printer.connection_state().borrow(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub host: String,
    pub id: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub access_code: Option<String>,
}

fn default_transport() -> TransportKind {
    TransportKind::WebSocket
}

impl RegisterRequest {
    fn into_config(self) -> PrinterConfig {
        let device = Device::new(self.id, self.host, self.model.unwrap_or_default(), self.transport);
        let mut config = PrinterConfig::new(device);
        config.port = self.port;
        config.access_code = self.access_code.map(SecretString::from);
        config
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn list_printers(State(gateway): State<Gateway>) -> Json<Vec<PrinterSummary>> {
    Json(gateway.registry().printers().iter().map(PrinterSummary::from).collect())
}

async fn register_printer(
    State(gateway): State<Gateway>,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, GatewayError> {
    let printer = gateway.register(request.into_config()).await?;
    Ok((StatusCode::CREATED, Json(PrinterSummary::from(&printer))).into_response())
}

async fn unregister_printer(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    gateway.unregister(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn printer_status(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<Json<Option<Arc<StatusSnapshot>>>, GatewayError> {
    Ok(Json(gateway.lookup(&id)?.status()))
}

async fn printer_attributes(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<Json<Option<Arc<Attributes>>>, GatewayError> {
    Ok(Json(gateway.lookup(&id)?.attributes()))
}

async fn printer_history(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<Json<Arc<Vec<Arc<PrintHistoryEntry>>>>, GatewayError> {
    Ok(Json(gateway.lookup(&id)?.history()))
}

async fn printer_command(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Json(command): Json<Command>,
) -> Result<Json<CommandResult>, GatewayError> {
    let printer = gateway.lookup(&id)?;
    Ok(Json(printer.execute(command).await?))
}
