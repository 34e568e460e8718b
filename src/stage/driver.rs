// High-level driver for the two-axis stage controller
//
// Validates every argument, formats the protocol command and decodes the
// response. Nothing is written to the port until all arguments are accepted.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use super::error::{Result, StageError};
use super::protocol::{
    check_encoder_cpr, check_range, parse_digits, parse_int, parse_scaled, strip_echo, Address,
    BaudRate, Command, ConfigMode, CurrentRange, CurrentScale, Direction, Input, Motor, Opcode,
    Output, SetPointIndex, StopKind, DEGREE_RANGE, HOMING_LOAD_ERROR_RANGE, LOAD_ERROR_RANGE,
    MICROSTEP_RANGE, POSITION_RANGE, RATE_RANGE,
};
use super::transport::Transport;
use crate::config::{StageConfig, MOTOR_MAX_CURRENT};
use crate::messages::{InputStates, MotorReport, MotorStatus, SetPoint};

/// Driver for the stage controller and its two motors
pub struct Stage {
    transport: Transport,
    motor_max_current: f64,
    current_range: Mutex<CurrentRange>,
}

impl Default for Stage {
    fn default() -> Self {
        Self::new(MOTOR_MAX_CURRENT, true)
    }
}

impl Stage {
    /// Create a disconnected driver
    pub fn new(motor_max_current: f64, low_current_range: bool) -> Self {
        Self::with_transport(Transport::new(), motor_max_current, low_current_range)
    }

    /// Create a driver around an existing transport
    pub fn with_transport(
        transport: Transport,
        motor_max_current: f64,
        low_current_range: bool,
    ) -> Self {
        let range = if low_current_range {
            CurrentRange::Low
        } else {
            CurrentRange::High
        };
        Self {
            transport,
            motor_max_current,
            current_range: Mutex::new(range),
        }
    }

    /// Create a driver from a config file and try to connect to its port.
    /// Check [`Stage::is_connected`] afterwards.
    pub fn from_config(config: &StageConfig) -> Self {
        let stage = Self::new(config.motor_max_current, config.low_current_range);
        stage.connect(&config.port, config.baud_rate, config.timeout());
        stage
    }

    pub fn connect(&self, port: &str, baudrate: u32, timeout: Duration) -> bool {
        self.transport.open(port, baudrate, timeout)
    }

    pub fn disconnect(&self) {
        self.transport.close();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn motor_max_current(&self) -> f64 {
        self.motor_max_current
    }

    pub fn current_scale(&self) -> CurrentScale {
        let range = *self
            .current_range
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        CurrentScale::new(range, self.motor_max_current)
    }

    // === Wire helpers ===

    fn send(&self, command: Command) -> Result<()> {
        self.transport.send_command(command.as_str())
    }

    /// Send a query and return the payload with any echo removed
    fn query(&self, query: &Command) -> Result<String> {
        let response = self.transport.send_query(query.as_str())?;
        Ok(strip_echo(&response, query.as_str()).to_string())
    }

    fn query_int(&self, motor: Motor, opcode: Opcode) -> Result<i64> {
        let query = Command::new(motor, opcode);
        let payload = self.query(&query)?;
        parse_int(query.as_str(), &payload)
    }

    fn query_config_mode(&self, motor: Motor, opcode: Opcode) -> Result<ConfigMode> {
        let query = Command::new(motor, opcode);
        let payload = self.query(&query)?;
        let code = parse_int(query.as_str(), &payload)?;
        u8::try_from(code)
            .ok()
            .and_then(|c| ConfigMode::try_from(c).ok())
            .ok_or_else(|| StageError::decode(query.as_str(), &payload, "unknown config mode"))
    }

    fn set_rate(&self, motor: u8, opcode: Opcode, name: &'static str, value: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let value = check_range(name, value, &RATE_RANGE)?;
        self.send(Command::new(motor, opcode).arg(value))
    }

    // === Non-volatile settings ===

    /// Acceleration stored in non-volatile memory (steps/s²)
    pub fn set_nv_accel(&self, motor: u8, value: i64) -> Result<()> {
        self.set_rate(motor, Opcode::NvAccel, "acceleration", value)
    }

    /// Max speed stored in non-volatile memory (steps/s)
    pub fn set_nv_speed(&self, motor: u8, value: i64) -> Result<()> {
        self.set_rate(motor, Opcode::NvSpeed, "speed", value)
    }

    pub fn get_nv_accel(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::NvAccel)
    }

    pub fn get_nv_speed(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::NvSpeed)
    }

    // === Set points ===

    /// Store a (position, velocity, acceleration) profile in slot 0-9
    pub fn edit_set_point(
        &self,
        motor: u8,
        set_point: u8,
        position: i64,
        velocity: i64,
        acceleration: i64,
    ) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let index = SetPointIndex::try_from(set_point)?;
        let position = check_range("position", position, &POSITION_RANGE)?;
        let velocity = check_range("velocity", velocity, &RATE_RANGE)?;
        let acceleration = check_range("acceleration", acceleration, &RATE_RANGE)?;

        self.send(
            Command::new(motor, Opcode::SetPoint(index))
                .arg(format_args!("{position},{velocity},{acceleration}")),
        )
    }

    pub fn get_set_point(&self, motor: u8, set_point: u8) -> Result<SetPoint> {
        let motor = Motor::try_from(motor)?;
        let index = SetPointIndex::try_from(set_point)?;
        let query = Command::new(motor, Opcode::SetPoint(index));
        let payload = self.query(&query)?;

        let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
        let &[position, velocity, acceleration] = fields.as_slice() else {
            return Err(StageError::decode(
                query.as_str(),
                &payload,
                "expected position,velocity,acceleration",
            ));
        };
        Ok(SetPoint {
            position: parse_int(query.as_str(), position)?,
            velocity: parse_int(query.as_str(), velocity)?,
            acceleration: parse_int(query.as_str(), acceleration)?,
        })
    }

    /// Move to a stored set point
    pub fn goto_set_point(&self, motor: u8, set_point: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let index = SetPointIndex::try_from(set_point)?;
        self.send(Command::new(motor, Opcode::GotoSetPoint).arg(index.get()))
    }

    // === Movement settings ===

    pub fn halt(&self, motor: u8, kind: StopKind) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        info!("Halting motor {} ({:?} stop)", motor, kind);
        self.send(Command::new(motor, Opcode::Halt).arg(kind.code()))
    }

    pub fn set_microsteps(&self, motor: u8, microsteps: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let microsteps = check_range("microsteps", microsteps, &MICROSTEP_RANGE)?;
        self.send(Command::new(motor, Opcode::Microsteps).arg(microsteps))
    }

    pub fn get_microsteps(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::Microsteps)
    }

    /// Set the spin direction, "CW" or "CCW" (case-insensitive)
    pub fn set_direction(&self, motor: u8, direction: &str) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let direction: Direction = direction.parse()?;
        self.send(Command::new(motor, Opcode::Direction).arg(direction.code()))
    }

    pub fn get_direction(&self, motor: u8) -> Result<Direction> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::Direction);
        let payload = self.query(&query)?;
        Direction::from_code(&payload)
            .ok_or_else(|| StageError::decode(query.as_str(), &payload, "expected 0 or 1"))
    }

    pub fn set_accel(&self, motor: u8, value: i64) -> Result<()> {
        self.set_rate(motor, Opcode::Accel, "acceleration", value)
    }

    pub fn get_accel(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::Accel)
    }

    pub fn set_speed(&self, motor: u8, value: i64) -> Result<()> {
        self.set_rate(motor, Opcode::Speed, "speed", value)
    }

    pub fn get_speed(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::Speed)
    }

    /// Max velocity in steps/s
    pub fn set_velocity(&self, motor: u8, value: i64) -> Result<()> {
        self.set_rate(motor, Opcode::Velocity, "velocity", value)
    }

    pub fn get_velocity(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::Velocity)
    }

    /// Allowable following error (steps) before the motor faults
    pub fn set_load_error(&self, motor: u8, value: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let value = check_range("load error", value, &LOAD_ERROR_RANGE)?;
        self.send(Command::new(motor, Opcode::LoadError).arg(value))
    }

    pub fn get_load_error(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::LoadError)
    }

    /// Motor speed in RPM; NaN when the controller reports no value
    pub fn get_rpm(&self, motor: u8) -> Result<f64> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::Rpm);
        let payload = self.query(&query)?;
        parse_scaled(query.as_str(), &payload, 100.0)
    }

    // === Positioning ===

    /// Move relative to the current position (negative steps move backwards)
    pub fn jog(&self, motor: u8, steps: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let steps = check_range("steps", steps, &POSITION_RANGE)?;
        self.send(Command::new(motor, Opcode::Jog).arg(steps))
    }

    pub fn goto_pos(&self, motor: u8, position: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let position = check_range("position", position, &POSITION_RANGE)?;
        self.send(Command::new(motor, Opcode::Position).arg(position))
    }

    pub fn get_pos(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::Position)
    }

    /// Move to an absolute angle in degrees (0-360, 0.1° resolution)
    pub fn goto_abs_pos(&self, motor: u8, degrees: f64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        if !DEGREE_RANGE.contains(&degrees) {
            return Err(StageError::invalid("position", degrees, "0 to 360.0 degrees"));
        }
        let tenths = (degrees * 10.0).round() as i64;
        self.send(Command::new(motor, Opcode::AbsPosition).arg(tenths))
    }

    /// Absolute angle in degrees; NaN when the controller reports no value
    pub fn get_abs_pos(&self, motor: u8) -> Result<f64> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::AbsPosition);
        let payload = self.query(&query)?;
        parse_scaled(query.as_str(), &payload, 10.0)
    }

    pub fn get_encoder_pos(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::EncoderCount)
    }

    /// Following error as micro-steps relative to the encoder count
    pub fn get_following_error(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::FollowingError)
    }

    /// Make the current position the motor's zero
    pub fn set_zero(&self, motor: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        self.send(Command::new(motor, Opcode::SetZero))
    }

    // === Phase current ===

    /// Switch between the high (2.0 A) and low (1.0 A) range: 0 = high, 1 = low
    pub fn set_current_range(&self, motor: u8, value: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let range = CurrentRange::try_from(value)?;
        self.send(Command::new(motor, Opcode::CurrentRange).arg(range.code()))?;

        info!("Current range set to {:?} ({} A)", range, range.amps());
        *self
            .current_range
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = range;
        Ok(())
    }

    pub fn get_current_range(&self, motor: u8) -> Result<CurrentRange> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::CurrentRange);
        let payload = self.query(&query)?;
        let code = parse_int(query.as_str(), &payload)?;
        u8::try_from(code)
            .ok()
            .and_then(|c| CurrentRange::try_from(c).ok())
            .ok_or_else(|| StageError::decode(query.as_str(), &payload, "expected 0 or 1"))
    }

    fn set_current(&self, motor: u8, opcode: Opcode, amps: f64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let scale = self.current_scale();
        let raw = scale.to_raw(amps)?;
        if amps > self.motor_max_current {
            warn!(
                "Requested {} A exceeds the {} A motor rating; clamped to raw {}",
                amps, self.motor_max_current, raw
            );
        }
        self.send(Command::new(motor, opcode).arg(raw))
    }

    /// Current (amps) applied while the motor is stationary
    pub fn set_holding_current(&self, motor: u8, amps: f64) -> Result<()> {
        self.set_current(motor, Opcode::HoldingCurrent, amps)
    }

    /// Current (amps) applied while the motor is moving
    pub fn set_run_current(&self, motor: u8, amps: f64) -> Result<()> {
        self.set_current(motor, Opcode::RunCurrent, amps)
    }

    pub fn get_holding_current(&self, motor: u8) -> Result<f64> {
        let raw = self.query_int(Motor::try_from(motor)?, Opcode::HoldingCurrent)?;
        Ok(self.current_scale().to_amps(raw))
    }

    pub fn get_run_current(&self, motor: u8) -> Result<f64> {
        let raw = self.query_int(Motor::try_from(motor)?, Opcode::RunCurrent)?;
        Ok(self.current_scale().to_amps(raw))
    }

    // === Initialization and I/O ===

    /// Re-initialize the motor; its position counter resets to zero
    pub fn init_motor(&self, motor: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        info!("Initializing motor {}", motor);
        self.send(Command::new(motor, Opcode::Init).arg(1))
    }

    /// Force output 1 or 2 low (0) or high (1)
    pub fn set_output(&self, motor: u8, output: u8, state: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let output = Output::try_from(output)?;
        if state > 1 {
            return Err(StageError::invalid("output state", state, "0=Off or 1=On"));
        }
        self.send(Command::new(motor, Opcode::OutputState(output)).arg(state))
    }

    pub fn get_output_status(&self, motor: u8, output: u8) -> Result<i64> {
        let motor = Motor::try_from(motor)?;
        let output = Output::try_from(output)?;
        self.query_int(motor, Opcode::OutputState(output))
    }

    pub fn set_output_config(&self, motor: u8, output: u8, mode: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let output = Output::try_from(output)?;
        let mode = ConfigMode::try_from(mode)?;
        self.send(Command::new(motor, Opcode::OutputConfig(output)).arg(mode.code()))
    }

    pub fn get_output_config(&self, motor: u8, output: u8) -> Result<ConfigMode> {
        let motor = Motor::try_from(motor)?;
        let output = Output::try_from(output)?;
        self.query_config_mode(motor, Opcode::OutputConfig(output))
    }

    pub fn set_input_config(&self, motor: u8, input: u8, mode: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let input = Input::try_from(input)?;
        let mode = ConfigMode::try_from(mode)?;
        self.send(Command::new(motor, Opcode::InputConfig(input)).arg(mode.code()))
    }

    pub fn get_input_config(&self, motor: u8, input: u8) -> Result<ConfigMode> {
        let motor = Motor::try_from(motor)?;
        let input = Input::try_from(input)?;
        self.query_config_mode(motor, Opcode::InputConfig(input))
    }

    pub fn set_index_config(&self, motor: u8, mode: u8) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let mode = ConfigMode::try_from(mode)?;
        self.send(Command::new(motor, Opcode::IndexConfig).arg(mode.code()))
    }

    pub fn get_index_config(&self, motor: u8) -> Result<ConfigMode> {
        self.query_config_mode(Motor::try_from(motor)?, Opcode::IndexConfig)
    }

    /// Encoder quadrature counts per revolution (PPR x 4); factory setting is 8192
    pub fn set_encoder_cpr(&self, motor: u8, value: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let cpr = check_encoder_cpr(value)?;
        self.send(Command::new(motor, Opcode::EncoderCpr).arg(cpr))
    }

    pub fn get_encoder_cpr(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::EncoderCpr)
    }

    // === Homing ===

    /// Allowable error before a hard stop is detected while homing
    pub fn set_homing_load_error(&self, motor: u8, value: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let value = check_range("homing load error", value, &HOMING_LOAD_ERROR_RANGE)?;
        self.send(Command::new(motor, Opcode::HomingLoadError).arg(value))
    }

    pub fn get_homing_load_error(&self, motor: u8) -> Result<i64> {
        self.query_int(Motor::try_from(motor)?, Opcode::HomingLoadError)
    }

    pub fn set_home(&self, motor: u8, position: i64) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let position = check_range("position", position, &POSITION_RANGE)?;
        self.send(Command::new(motor, Opcode::HomePosition).arg(position))
    }

    // === Communication ===

    pub fn set_baud(&self, motor: u8, baud: u32) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let baud = BaudRate::try_from(baud)?;
        self.send(Command::new(motor, Opcode::Baud).arg(baud.code()))
    }

    /// `None` when the controller has no baud rate stored
    pub fn get_baud(&self, motor: u8) -> Result<Option<BaudRate>> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::Baud);
        let payload = self.query(&query)?;
        BaudRate::from_code(&payload)
            .ok_or_else(|| StageError::decode(query.as_str(), &payload, "expected 0-5"))
    }

    pub fn set_address(&self, motor: u8, address: &str) -> Result<()> {
        let motor = Motor::try_from(motor)?;
        let address: Address = address.parse()?;
        self.send(Command::new(motor, Opcode::Address).arg(address.as_char()))
    }

    /// Addresses of all connected motors as reported by the controller
    pub fn get_addresses(&self) -> Result<String> {
        // Addressed to 0 regardless of which motor answers
        self.query(&Command::new(Motor::Both, Opcode::Address))
    }

    /// Series revision date, e.g. "xyz"
    pub fn get_firmware_rev(&self, motor: u8) -> Result<String> {
        self.query(&Command::new(Motor::try_from(motor)?, Opcode::FirmwareRev))
    }

    // === Status ===

    /// System status and active set point, undecoded
    pub fn get_status(&self, motor: u8) -> Result<String> {
        self.query(&Command::new(Motor::try_from(motor)?, Opcode::Status))
    }

    pub fn get_motor_status(&self, motor: u8) -> Result<MotorStatus> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::MotorStatus);
        let payload = self.query(&query)?;
        let digits = parse_digits(query.as_str(), &payload)?;
        match *digits.as_slice() {
            [run_state, condition] => MotorStatus::from_codes(run_state, condition),
            _ => None,
        }
        .ok_or_else(|| StageError::decode(query.as_str(), &payload, "unknown motor status"))
    }

    /// Levels of inputs 1-4 and the index line
    pub fn get_input_states(&self, motor: u8) -> Result<InputStates> {
        let query = Command::new(Motor::try_from(motor)?, Opcode::InputStates);
        let payload = self.query(&query)?;
        Ok(InputStates {
            levels: parse_digits(query.as_str(), &payload)?,
        })
    }

    /// Collect the commonly displayed settings of one axis
    pub fn report(&self, motor: u8) -> Result<MotorReport> {
        let axis = Motor::axis(motor)?.number();
        Ok(MotorReport {
            motor: axis,
            firmware: self.get_firmware_rev(axis)?,
            position: self.get_pos(axis)?,
            encoder_count: self.get_encoder_pos(axis)?,
            speed: self.get_speed(axis)?,
            acceleration: self.get_accel(axis)?,
            velocity: self.get_velocity(axis)?,
            nv_speed: self.get_nv_speed(axis)?,
            nv_acceleration: self.get_nv_accel(axis)?,
            microsteps: self.get_microsteps(axis)?,
            direction: self.get_direction(axis)?,
            current_range: self.get_current_range(axis)?,
            holding_current: self.get_holding_current(axis)?,
            run_current: self.get_run_current(axis)?,
            load_error: self.get_load_error(axis)?,
            homing_load_error: self.get_homing_load_error(axis)?,
            encoder_cpr: self.get_encoder_cpr(axis)?,
            index_config: self.get_index_config(axis)?,
            baud: self.get_baud(axis)?,
            status: self.get_motor_status(axis)?,
            inputs: self.get_input_states(axis)?,
        })
    }
}
