// Command-line front end for the stage driver
//
// Each invocation opens the port, runs one command and closes it again.
// Homing runs on a blocking worker while the async task watches for Ctrl+C.

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StageConfig;
use crate::stage::{CancelToken, HomingController, Stage, StageError, StopKind};

#[derive(Debug, Parser)]
#[command(
    name = "stage-control",
    version,
    about = "Control a two-axis motorized stage over serial"
)]
pub struct Cli {
    /// JSON config file (port, baud_rate, timeout_ms, motor_max_current, low_current_range)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Serial port, overrides the config file
    #[arg(long)]
    pub port: Option<String>,

    /// Baud rate, overrides the config file
    #[arg(long)]
    pub baud: Option<u32>,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Print the main settings of one axis as JSON
    Report {
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Read one parameter
    Get {
        param: Param,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
        /// Input, output or set point number for indexed parameters
        #[arg(short, long)]
        index: Option<u8>,
    },
    /// Write one parameter
    Set {
        param: Param,
        #[arg(allow_negative_numbers = true)]
        value: String,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
        #[arg(short, long)]
        index: Option<u8>,
    },
    /// Move to an absolute step position
    Goto {
        #[arg(allow_negative_numbers = true)]
        position: i64,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Move to an absolute angle in degrees
    GotoAbs {
        degrees: f64,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Move to a stored set point
    GotoSetPoint {
        set_point: u8,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Store a set point profile
    EditSetPoint {
        set_point: u8,
        #[arg(allow_negative_numbers = true)]
        position: i64,
        velocity: i64,
        acceleration: i64,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Move a number of steps relative to the current position
    Jog {
        #[arg(allow_negative_numbers = true)]
        steps: i64,
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Stop motion (both motors by default)
    Halt {
        #[arg(short, long, default_value_t = 0)]
        motor: u8,
        /// Decelerate instead of stopping immediately
        #[arg(long)]
        soft: bool,
    },
    /// Re-initialize a motor (resets its position to zero)
    Init {
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Make the current position zero
    Zero {
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
    },
    /// Home an axis against its limit switch; Ctrl+C halts the motor
    Home {
        #[arg(short, long, default_value_t = 1)]
        motor: u8,
        /// Homing velocity in steps/s; defaults to the stored velocity
        #[arg(long)]
        speed: Option<i64>,
        /// Go to set point 0 once homed
        #[arg(long)]
        center: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Param {
    NvAccel,
    NvSpeed,
    Accel,
    Speed,
    Velocity,
    Position,
    AbsPosition,
    EncoderCount,
    FollowingError,
    Rpm,
    Microsteps,
    Direction,
    LoadError,
    HomingLoadError,
    Home,
    CurrentRange,
    HoldingCurrent,
    RunCurrent,
    EncoderCpr,
    IndexConfig,
    InputConfig,
    OutputConfig,
    Output,
    Baud,
    Address,
    Addresses,
    Firmware,
    Status,
    MotorStatus,
    Inputs,
    SetPoint,
}

impl Param {
    fn label(self) -> String {
        self.to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default()
    }
}

fn parse_value<T: FromStr>(param: Param, raw: &str, expected: &str) -> Result<T, StageError> {
    raw.trim().parse().map_err(|_| {
        let expected = format!("{expected} for {}", param.label());
        StageError::invalid("value", format!("{raw:?}"), expected)
    })
}

fn require_index(param: Param, index: Option<u8>) -> Result<u8, StageError> {
    index.ok_or_else(|| {
        StageError::invalid("index", "nothing", format!("--index for {}", param.label()))
    })
}

fn unsupported(param: Param, action: &str) -> StageError {
    let expected = format!("a parameter that supports {action}");
    StageError::invalid("parameter", param.label(), expected)
}

/// Read a parameter and render it as JSON
pub fn read_param(
    stage: &Stage,
    motor: u8,
    param: Param,
    index: Option<u8>,
) -> crate::stage::Result<Value> {
    let value = match param {
        Param::NvAccel => json!(stage.get_nv_accel(motor)?),
        Param::NvSpeed => json!(stage.get_nv_speed(motor)?),
        Param::Accel => json!(stage.get_accel(motor)?),
        Param::Speed => json!(stage.get_speed(motor)?),
        Param::Velocity => json!(stage.get_velocity(motor)?),
        Param::Position => json!(stage.get_pos(motor)?),
        Param::AbsPosition => json!(stage.get_abs_pos(motor)?),
        Param::EncoderCount => json!(stage.get_encoder_pos(motor)?),
        Param::FollowingError => json!(stage.get_following_error(motor)?),
        Param::Rpm => json!(stage.get_rpm(motor)?),
        Param::Microsteps => json!(stage.get_microsteps(motor)?),
        Param::Direction => json!(stage.get_direction(motor)?),
        Param::LoadError => json!(stage.get_load_error(motor)?),
        Param::HomingLoadError => json!(stage.get_homing_load_error(motor)?),
        Param::CurrentRange => json!(stage.get_current_range(motor)?),
        Param::HoldingCurrent => json!(stage.get_holding_current(motor)?),
        Param::RunCurrent => json!(stage.get_run_current(motor)?),
        Param::EncoderCpr => json!(stage.get_encoder_cpr(motor)?),
        Param::IndexConfig => json!(stage.get_index_config(motor)?),
        Param::InputConfig => {
            json!(stage.get_input_config(motor, require_index(param, index)?)?)
        }
        Param::OutputConfig => {
            json!(stage.get_output_config(motor, require_index(param, index)?)?)
        }
        Param::Output => json!(stage.get_output_status(motor, require_index(param, index)?)?),
        Param::Baud => json!(stage.get_baud(motor)?.map(|b| b.bits_per_second())),
        Param::Addresses => json!(stage.get_addresses()?),
        Param::Firmware => json!(stage.get_firmware_rev(motor)?),
        Param::Status => json!(stage.get_status(motor)?),
        Param::MotorStatus => json!(stage.get_motor_status(motor)?),
        Param::Inputs => json!(stage.get_input_states(motor)?),
        Param::SetPoint => json!(stage.get_set_point(motor, require_index(param, index)?)?),
        Param::Home | Param::Address => return Err(unsupported(param, "get")),
    };
    Ok(value)
}

/// Parse `raw` for `param` and write it
pub fn write_param(
    stage: &Stage,
    motor: u8,
    param: Param,
    raw: &str,
    index: Option<u8>,
) -> crate::stage::Result<()> {
    const INT: &str = "an integer";
    const AMPS: &str = "a current in amps";
    const MODE: &str = "a configuration mode 0-3";

    match param {
        Param::NvAccel => stage.set_nv_accel(motor, parse_value(param, raw, INT)?),
        Param::NvSpeed => stage.set_nv_speed(motor, parse_value(param, raw, INT)?),
        Param::Accel => stage.set_accel(motor, parse_value(param, raw, INT)?),
        Param::Speed => stage.set_speed(motor, parse_value(param, raw, INT)?),
        Param::Velocity => stage.set_velocity(motor, parse_value(param, raw, INT)?),
        Param::Position => stage.goto_pos(motor, parse_value(param, raw, INT)?),
        Param::AbsPosition => stage.goto_abs_pos(motor, parse_value(param, raw, "degrees")?),
        Param::Microsteps => stage.set_microsteps(motor, parse_value(param, raw, INT)?),
        Param::Direction => stage.set_direction(motor, raw.trim()),
        Param::LoadError => stage.set_load_error(motor, parse_value(param, raw, INT)?),
        Param::HomingLoadError => {
            stage.set_homing_load_error(motor, parse_value(param, raw, INT)?)
        }
        Param::Home => stage.set_home(motor, parse_value(param, raw, INT)?),
        Param::CurrentRange => {
            stage.set_current_range(motor, parse_value(param, raw, "0 (high) or 1 (low)")?)
        }
        Param::HoldingCurrent => stage.set_holding_current(motor, parse_value(param, raw, AMPS)?),
        Param::RunCurrent => stage.set_run_current(motor, parse_value(param, raw, AMPS)?),
        Param::EncoderCpr => stage.set_encoder_cpr(motor, parse_value(param, raw, INT)?),
        Param::IndexConfig => stage.set_index_config(motor, parse_value(param, raw, MODE)?),
        Param::InputConfig => stage.set_input_config(
            motor,
            require_index(param, index)?,
            parse_value(param, raw, MODE)?,
        ),
        Param::OutputConfig => stage.set_output_config(
            motor,
            require_index(param, index)?,
            parse_value(param, raw, MODE)?,
        ),
        Param::Output => stage.set_output(
            motor,
            require_index(param, index)?,
            parse_value(param, raw, "0=Off or 1=On")?,
        ),
        Param::Baud => stage.set_baud(motor, parse_value(param, raw, "a baud rate")?),
        Param::Address => stage.set_address(motor, raw.trim()),
        Param::EncoderCount
        | Param::FollowingError
        | Param::Rpm
        | Param::Addresses
        | Param::Firmware
        | Param::Status
        | Param::MotorStatus
        | Param::Inputs
        | Param::SetPoint => Err(unsupported(param, "set")),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Home on a blocking worker; Ctrl+C trips the cancel token so the motor is halted
async fn home(
    stage: Arc<Stage>,
    motor: u8,
    speed: Option<i64>,
    center: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let token = CancelToken::new();
    let worker_token = token.clone();

    let mut task = tokio::task::spawn_blocking(move || {
        let mut homing = HomingController::new(stage);
        homing.home(motor, speed, &worker_token)?;
        if center {
            homing.center(motor)?;
        }
        Ok::<_, StageError>(())
    });

    let result = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl+C received, stopping motor {}", motor);
            token.cancel();
            task.await?
        }
    };
    Ok(result?)
}

pub async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => StageConfig::load(path)?,
        None => StageConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }

    let stage = Arc::new(Stage::from_config(&config));
    if !stage.is_connected() {
        return Err(StageError::NotConnected.into());
    }
    info!("Connected to stage on {}", config.port);

    match cli.command {
        Cmd::Report { motor } => print_json(&stage.report(motor)?)?,
        Cmd::Get {
            param,
            motor,
            index,
        } => print_json(&read_param(&stage, motor, param, index)?)?,
        Cmd::Set {
            param,
            value,
            motor,
            index,
        } => write_param(&stage, motor, param, &value, index)?,
        Cmd::Goto { position, motor } => stage.goto_pos(motor, position)?,
        Cmd::GotoAbs { degrees, motor } => stage.goto_abs_pos(motor, degrees)?,
        Cmd::GotoSetPoint { set_point, motor } => stage.goto_set_point(motor, set_point)?,
        Cmd::EditSetPoint {
            set_point,
            position,
            velocity,
            acceleration,
            motor,
        } => stage.edit_set_point(motor, set_point, position, velocity, acceleration)?,
        Cmd::Jog { steps, motor } => stage.jog(motor, steps)?,
        Cmd::Halt { motor, soft } => {
            let kind = if soft { StopKind::Soft } else { StopKind::Hard };
            stage.halt(motor, kind)?
        }
        Cmd::Init { motor } => stage.init_motor(motor)?,
        Cmd::Zero { motor } => stage.set_zero(motor)?,
        Cmd::Home {
            motor,
            speed,
            center,
        } => home(Arc::clone(&stage), motor, speed, center).await?,
    }

    stage.disconnect();
    Ok(())
}
