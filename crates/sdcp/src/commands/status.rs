//! Status, attributes and history handlers.

use std::sync::Arc;

use tabled::Tabled;

use sdcp_core::{
    Attributes, Command, CommandResult, PrintHistoryEntry, Printer, StatusSnapshot, Temperature,
};

use crate::cli::{OutputFormat, StatusArgs};
use crate::error::CliError;
use crate::output;

use super::Context;

// ── Status ───────────────────────────────────────────────────────────

fn temperature(t: Option<&Temperature>) -> String {
    match t {
        Some(Temperature {
            current,
            target: Some(target),
        }) => format!("{current:.1} / {target:.1} °C"),
        Some(Temperature { current, .. }) => format!("{current:.1} °C"),
        None => "-".into(),
    }
}

fn status_detail(s: &Arc<StatusSnapshot>) -> Vec<(&'static str, String)> {
    let print = &s.print;
    let mut pairs = vec![
        ("Machine", s.machine_status.label().to_owned()),
        ("Print", print.status.label().to_owned()),
        ("File", output::or_dash(print.filename.as_deref())),
        (
            "Progress",
            format!(
                "{:.1}% (layer {}/{})",
                print.percent_complete, print.current_layer, print.total_layers
            ),
        ),
        (
            "Time",
            format!(
                "{} elapsed, {} remaining",
                output::duration_ms(print.current_time_ms),
                output::duration_ms(print.remaining_time_ms)
            ),
        ),
        ("Nozzle", temperature(s.temperatures.nozzle.as_ref())),
        ("Bed", temperature(s.temperatures.bed.as_ref())),
        ("Chamber", temperature(s.temperatures.chamber.as_ref())),
        (
            "Fans",
            format!(
                "model {}  aux {}  box {}",
                output::or_dash(s.fans.model),
                output::or_dash(s.fans.auxiliary),
                output::or_dash(s.fans.chamber)
            ),
        ),
    ];
    if let Some(speed) = print.print_speed_pct {
        pairs.push(("Speed", format!("{speed}%")));
    }
    if let Some(light) = &s.light {
        pairs.push(("Light", if light.on { "on" } else { "off" }.into()));
    }
    if let Some(p) = &s.position {
        pairs.push(("Position", format!("X{:.2} Y{:.2} Z{:.2}", p.x, p.y, p.z)));
    }
    if print.error_code != 0 {
        pairs.push(("Error", print.error_code.to_string()));
    }
    pairs.push(("Updated", s.updated_at.to_rfc3339()));
    pairs
}

/// One line per push in `--watch` table mode.
fn status_line(s: &StatusSnapshot, color: bool) -> String {
    format!(
        "{}  {:<10} {:>5.1}%  layer {}/{}  nozzle {}  bed {}",
        s.updated_at.format("%H:%M:%S"),
        output::emphasize(s.print.status.label(), color),
        s.print.percent_complete,
        s.print.current_layer,
        s.print.total_layers,
        temperature(s.temperatures.nozzle.as_ref()),
        temperature(s.temperatures.bed.as_ref()),
    )
}

pub async fn status(args: StatusArgs, ctx: &Context) -> Result<(), CliError> {
    let printer = ctx.connect().await?;
    let result = if args.watch {
        watch(&printer, ctx).await
    } else {
        show_status(&printer, ctx).await
    };
    printer.disconnect().await;
    result
}

async fn show_status(printer: &Printer, ctx: &Context) -> Result<(), CliError> {
    let CommandResult::Status(Some(snapshot)) = printer.execute(Command::RefreshStatus).await?
    else {
        return Err(CliError::NoData {
            what: "a status".into(),
        });
    };
    let rendered = output::render_single(ctx.output()?, &snapshot, status_detail)?;
    ctx.print(&rendered);
    Ok(())
}

async fn watch(printer: &Printer, ctx: &Context) -> Result<(), CliError> {
    let format = ctx.output()?;
    let color = ctx.color();
    let mut stream = printer.status_stream();
    if let Some(current) = stream.current() {
        ctx.print(&render_push(format, current, color)?);
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = stream.changed() => match next {
                Some(snapshot) => ctx.print(&render_push(format, &snapshot, color)?),
                None => {
                    return Err(CliError::ConnectionLost {
                        reason: "status stream closed".into(),
                    });
                }
            },
        }
    }
    Ok(())
}

fn render_push(
    format: OutputFormat,
    snapshot: &StatusSnapshot,
    color: bool,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Table => Ok(status_line(snapshot, color)),
        // One document per line so the stream stays parseable.
        OutputFormat::Json | OutputFormat::JsonCompact => output::render_json(snapshot, true),
        OutputFormat::Yaml => Ok(format!("---\n{}", output::render_yaml(snapshot)?)),
    }
}

// ── Attributes ───────────────────────────────────────────────────────

fn attributes_detail(a: &Arc<Attributes>) -> Vec<(&'static str, String)> {
    vec![
        ("Name", a.name.clone()),
        ("Model", a.machine_name.clone()),
        ("Brand", output::or_dash(a.brand_name.as_deref())),
        ("Mainboard", a.mainboard_id.clone()),
        ("Address", output::or_dash(a.mainboard_ip.as_deref())),
        ("Protocol", output::or_dash(a.protocol_version.as_deref())),
        ("Firmware", output::or_dash(a.firmware_version.as_deref())),
        ("Resolution", output::or_dash(a.resolution.as_deref())),
        ("Volume", output::or_dash(a.build_volume.as_deref())),
        ("Capabilities", a.capabilities.join(", ")),
        ("File types", a.supported_file_types.join(", ")),
        (
            "Video streams",
            format!(
                "{}/{}",
                output::or_dash(a.video_streams_connected),
                output::or_dash(a.video_streams_max)
            ),
        ),
        ("Free storage", output::or_dash(a.remaining_memory)),
        ("Camera", output::or_dash(a.camera_connected)),
        ("USB disk", output::or_dash(a.usb_disk_connected)),
    ]
}

pub async fn attributes(ctx: &Context) -> Result<(), CliError> {
    let printer = ctx.connect().await?;
    let result = printer.execute(Command::RefreshAttributes).await;
    printer.disconnect().await;

    let CommandResult::Attributes(Some(attributes)) = result? else {
        return Err(CliError::NoData {
            what: "its attributes".into(),
        });
    };
    let rendered = output::render_single(ctx.output()?, &attributes, attributes_detail)?;
    ctx.print(&rendered);
    Ok(())
}

// ── History ──────────────────────────────────────────────────────────

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Task")]
    task_id: String,
    #[tabled(rename = "File")]
    filename: String,
    #[tabled(rename = "Started")]
    begin: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Layers")]
    layers: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn history_row(entry: &Arc<PrintHistoryEntry>) -> HistoryRow {
    let duration = match (entry.begin_time, entry.end_time) {
        (Some(begin), Some(end)) if end >= begin => {
            output::duration_ms(u64::try_from((end - begin).num_milliseconds()).unwrap_or(0))
        }
        _ => "-".into(),
    };
    HistoryRow {
        task_id: entry.task_id.clone(),
        filename: output::or_dash(entry.filename.as_deref()),
        begin: output::or_dash(
            entry
                .begin_time
                .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")),
        ),
        duration,
        layers: output::or_dash(entry.layers_printed),
        status: output::or_dash(entry.status),
    }
}

pub async fn history(ctx: &Context) -> Result<(), CliError> {
    let printer = ctx.connect().await?;
    let result = printer.execute(Command::ListHistory).await;
    printer.disconnect().await;

    let entries = match result? {
        CommandResult::History(entries) => entries,
        _ => printer.history(),
    };
    let rendered = output::render_list(ctx.output()?, entries.as_slice(), history_row)?;
    ctx.print(&rendered);
    Ok(())
}
