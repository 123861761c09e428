//! Print control, parameter and video handlers.

use sdcp_core::{Command as CoreCommand, CommandResult};

use crate::cli::{Command, SetArgs, SetCommand, Toggle, VideoArgs, VideoCommand};
use crate::error::CliError;

use super::Context;

/// Connect, run one command, disconnect.
async fn run_once(ctx: &Context, command: CoreCommand) -> Result<CommandResult, CliError> {
    let printer = ctx.connect().await?;
    let result = printer.execute(command).await;
    printer.disconnect().await;
    Ok(result?)
}

pub async fn print_control(cmd: &Command, ctx: &Context) -> Result<(), CliError> {
    let (command, done) = match cmd {
        Command::Pause => (CoreCommand::Pause, "Print paused"),
        Command::Resume => (CoreCommand::Resume, "Print resumed"),
        Command::Stop => (CoreCommand::Stop, "Print stopped"),
        _ => return Ok(()),
    };
    run_once(ctx, command).await?;
    ctx.note(done);
    Ok(())
}

/// The command `sdcp set` issues. Values are clamped by the core before
/// they reach the printer.
fn set_command(args: &SetCommand) -> CoreCommand {
    match *args {
        SetCommand::Fan { fan, percent } => CoreCommand::SetFanSpeed { fan, percent },
        SetCommand::Speed { percent } => CoreCommand::SetPrintSpeed { percent },
        SetCommand::Nozzle { celsius } => CoreCommand::SetNozzleTemp { celsius },
        SetCommand::Bed { celsius } => CoreCommand::SetBedTemp { celsius },
        SetCommand::Light { state } => CoreCommand::SetLight {
            on: matches!(state, Toggle::On),
        },
    }
}

pub async fn set(args: SetArgs, ctx: &Context) -> Result<(), CliError> {
    let command = set_command(&args.command);
    let requested = command.clamped();
    if requested != command {
        tracing::warn!(?command, ?requested, "value clamped to the printer's safe range");
    }
    run_once(ctx, command).await?;
    ctx.note("Parameter updated");
    Ok(())
}

pub async fn video(args: VideoArgs, ctx: &Context) -> Result<(), CliError> {
    let enable = matches!(args.command, VideoCommand::Enable);
    match run_once(ctx, CoreCommand::SetVideo { enable }).await? {
        CommandResult::VideoUrl(Some(url)) => ctx.print(&url),
        CommandResult::VideoUrl(None) if !enable => ctx.note("Video stream disabled"),
        _ => ctx.note("Printer returned no stream URL"),
    }
    Ok(())
}
