// Stage controller ASCII protocol
//
// Command format: ":" Motor Opcode [Value] "\r"
// Responses are "<payload>\r", optionally preceded by an echo of the command.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use super::error::{Result, StageError};

/// Positions, jogs and set point targets are limited to about ±2^31 steps
pub const MAX_MOTOR_POSITION: i64 = 2_147_000_000;
pub const POSITION_RANGE: RangeInclusive<i64> = -MAX_MOTOR_POSITION..=MAX_MOTOR_POSITION;

/// Speed, velocity and acceleration registers are 16-bit
pub const RATE_RANGE: RangeInclusive<i64> = 0..=65_535;
pub const LOAD_ERROR_RANGE: RangeInclusive<i64> = 0..=65_535;
pub const HOMING_LOAD_ERROR_RANGE: RangeInclusive<i64> = 1..=65_535;
pub const MICROSTEP_RANGE: RangeInclusive<i64> = 2..=255;
pub const DEGREE_RANGE: RangeInclusive<f64> = 0.0..=360.0;

/// Raw current scale: 31 equals the full controller current range
pub const CONTROLLER_MAX_RAW_CURRENT: u8 = 31;

/// Supported encoder resolutions (quadrature counts = PPR x 4)
pub const QUADRATURE_COUNTS: [u16; 16] = [
    192, 276, 400, 500, 768, 800, 1000, 1024, 1536, 1600, 2000, 2048, 3200, 4000, 4096, 8192,
];

/// Response the controller sends when a value is unavailable
pub const ERROR_TOKEN: &str = "!";

fn list<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    let items: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    format!("one of [{}]", items.join(", "))
}

/// Validate an integer argument against an inclusive range
pub fn check_range(name: &'static str, value: i64, range: &RangeInclusive<i64>) -> Result<i64> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(StageError::invalid(
            name,
            value,
            format!("{} to {}", range.start(), range.end()),
        ))
    }
}

/// Motor selector; `Both` addresses the two axes at once
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Motor {
    Both = 0,
    X = 1,
    Y = 2,
}

impl Motor {
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Accept only a single axis (1 or 2)
    pub fn axis(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Motor::X),
            2 => Ok(Motor::Y),
            _ => Err(StageError::invalid("axis", value, "one of [1, 2]")),
        }
    }
}

impl TryFrom<u8> for Motor {
    type Error = StageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Motor::Both),
            1 => Ok(Motor::X),
            2 => Ok(Motor::Y),
            _ => Err(StageError::invalid("motor", value, "one of [0, 1, 2]")),
        }
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Digital output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    One,
    Two,
}

impl TryFrom<u8> for Output {
    type Error = StageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Output::One),
            2 => Ok(Output::Two),
            _ => Err(StageError::invalid("output", value, "one of [1, 2]")),
        }
    }
}

/// Digital input line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    One,
    Two,
    Three,
    Four,
}

impl TryFrom<u8> for Input {
    type Error = StageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Input::One),
            2 => Ok(Input::Two),
            3 => Ok(Input::Three),
            4 => Ok(Input::Four),
            _ => Err(StageError::invalid("input", value, "one of [1, 2, 3, 4]")),
        }
    }
}

/// Set point profile slot (0-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetPointIndex(u8);

impl SetPointIndex {
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SetPointIndex {
    type Error = StageError;

    fn try_from(value: u8) -> Result<Self> {
        if value <= 9 {
            Ok(SetPointIndex(value))
        } else {
            Err(StageError::invalid("set point", value, list(0..=9)))
        }
    }
}

/// Every operation code the controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    NvAccel,
    NvSpeed,
    Accel,
    Speed,
    Velocity,
    Position,
    AbsPosition,
    EncoderCount,
    HomePosition,
    GotoSetPoint,
    SetPoint(SetPointIndex),
    Halt,
    Init,
    SetZero,
    Jog,
    OutputState(Output),
    OutputConfig(Output),
    InputConfig(Input),
    IndexConfig,
    EncoderCpr,
    HoldingCurrent,
    RunCurrent,
    LoadError,
    HomingLoadError,
    Microsteps,
    Direction,
    CurrentRange,
    Baud,
    Address,
    FirmwareRev,
    Status,
    MotorStatus,
    InputStates,
    Rpm,
    FollowingError,
}

impl Opcode {
    pub fn as_char(self) -> char {
        match self {
            Opcode::NvAccel => 'A',
            Opcode::NvSpeed => 'S',
            Opcode::Accel => 'a',
            Opcode::Speed => 's',
            Opcode::Velocity => 'v',
            Opcode::Position => 'p',
            Opcode::AbsPosition => 'x',
            Opcode::EncoderCount => 'y',
            Opcode::HomePosition => 'c',
            Opcode::GotoSetPoint => 'd',
            Opcode::SetPoint(index) => char::from(b'0' + index.get()),
            Opcode::Halt => 'h',
            Opcode::Init => 'i',
            Opcode::SetZero => 'F',
            Opcode::Jog => 'j',
            Opcode::OutputState(Output::One) => 'o',
            Opcode::OutputState(Output::Two) => 'n',
            Opcode::OutputConfig(Output::One) => 'J',
            Opcode::OutputConfig(Output::Two) => 'K',
            Opcode::InputConfig(Input::One) => 'T',
            Opcode::InputConfig(Input::Two) => 'U',
            Opcode::InputConfig(Input::Three) => 'V',
            Opcode::InputConfig(Input::Four) => 'W',
            Opcode::IndexConfig => 'Z',
            Opcode::EncoderCpr => 'E',
            Opcode::HoldingCurrent => 'H',
            Opcode::RunCurrent => 'R',
            Opcode::LoadError => 'L',
            Opcode::HomingLoadError => 'I',
            Opcode::Microsteps => 'M',
            Opcode::Direction => 'C',
            Opcode::CurrentRange => 'O',
            Opcode::Baud => 'B',
            Opcode::Address => 'D',
            Opcode::FirmwareRev => 'z',
            Opcode::Status => 'f',
            Opcode::MotorStatus => 'g',
            Opcode::InputStates => 'l',
            Opcode::Rpm => 'u',
            Opcode::FollowingError => 'b',
        }
    }
}

/// Configuration mode shared by inputs, outputs and the index line
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    UserDefined = 0,
    MotorError = 1,
    MotorMoving = 2,
    MotorStopped = 3,
}

impl ConfigMode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ConfigMode {
    type Error = StageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConfigMode::UserDefined),
            1 => Ok(ConfigMode::MotorError),
            2 => Ok(ConfigMode::MotorMoving),
            3 => Ok(ConfigMode::MotorStopped),
            _ => Err(StageError::invalid(
                "configuration mode",
                value,
                "0=User Defined, 1=Motor Error, 2=Motor Moving, 3=Motor Stopped",
            )),
        }
    }
}

/// Halt behaviour
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Hard = 1,
    Soft = 2,
}

impl StopKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Rotation direction of positive moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    #[serde(rename = "CW")]
    Cw,
    #[serde(rename = "CCW")]
    Ccw,
}

impl Direction {
    pub fn code(self) -> u8 {
        match self {
            Direction::Cw => 0,
            Direction::Ccw => 1,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(Direction::Cw),
            "1" => Some(Direction::Ccw),
            _ => None,
        }
    }
}

impl FromStr for Direction {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CW" => Ok(Direction::Cw),
            "CCW" => Ok(Direction::Ccw),
            _ => Err(StageError::invalid("direction", format!("{s:?}"), "\"CW\" or \"CCW\"")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Cw => f.write_str("CW"),
            Direction::Ccw => f.write_str("CCW"),
        }
    }
}

/// Serial baud rates the controller can be switched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    pub const ALL: [BaudRate; 5] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19_200,
            BaudRate::B38400 => 38_400,
            BaudRate::B57600 => 57_600,
            BaudRate::B115200 => 115_200,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            BaudRate::B9600 => 1,
            BaudRate::B19200 => 2,
            BaudRate::B38400 => 3,
            BaudRate::B57600 => 4,
            BaudRate::B115200 => 5,
        }
    }

    /// Decode a baud code; `0` means the rate was never set
    pub fn from_code(code: &str) -> Option<Option<Self>> {
        match code {
            "0" => Some(None),
            "1" => Some(Some(BaudRate::B9600)),
            "2" => Some(Some(BaudRate::B19200)),
            "3" => Some(Some(BaudRate::B38400)),
            "4" => Some(Some(BaudRate::B57600)),
            "5" => Some(Some(BaudRate::B115200)),
            _ => None,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = StageError;

    fn try_from(value: u32) -> Result<Self> {
        BaudRate::ALL
            .into_iter()
            .find(|b| b.bits_per_second() == value)
            .ok_or_else(|| {
                StageError::invalid(
                    "baud rate",
                    value,
                    list(BaudRate::ALL.map(BaudRate::bits_per_second)),
                )
            })
    }
}

/// Controller current range; the raw 0-31 current scale spans this many amps
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentRange {
    High = 0,
    Low = 1,
}

impl CurrentRange {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn amps(self) -> f64 {
        match self {
            CurrentRange::High => 2.0,
            CurrentRange::Low => 1.0,
        }
    }
}

impl TryFrom<u8> for CurrentRange {
    type Error = StageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CurrentRange::High),
            1 => Ok(CurrentRange::Low),
            _ => Err(StageError::invalid(
                "current range",
                value,
                "0 (high range = 2.0A) or 1 (low range = 1.0A)",
            )),
        }
    }
}

/// Device address (0-9, A-F)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(char);

impl Address {
    pub fn as_char(self) -> char {
        self.0
    }
}

impl FromStr for Address {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_hexdigit() => Ok(Address(c.to_ascii_uppercase())),
            _ => Err(StageError::invalid("address", format!("{s:?}"), "one of 0-9, A-F")),
        }
    }
}

/// Validate an encoder counts-per-revolution setting
pub fn check_encoder_cpr(value: i64) -> Result<u16> {
    QUADRATURE_COUNTS
        .into_iter()
        .find(|&cpr| i64::from(cpr) == value)
        .ok_or_else(|| StageError::invalid("encoder CPR", value, list(QUADRATURE_COUNTS)))
}

/// Converts between amps and the controller's raw 0-31 current scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentScale {
    pub range: CurrentRange,
    pub motor_max_current: f64,
}

impl CurrentScale {
    pub fn new(range: CurrentRange, motor_max_current: f64) -> Self {
        Self {
            range,
            motor_max_current,
        }
    }

    pub fn amps_per_step(&self) -> f64 {
        self.range.amps() / f64::from(CONTROLLER_MAX_RAW_CURRENT)
    }

    /// Clamp a requested current to the motor and controller limits, then
    /// convert it to the raw scale
    pub fn to_raw(&self, amps: f64) -> Result<u8> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(StageError::invalid(
                "current",
                format!("{amps}A"),
                format!("0 to {}A", self.motor_max_current),
            ));
        }

        let step = self.amps_per_step();
        let motor_max_raw = (self.motor_max_current / step).floor();
        let requested = (amps / step).round();
        let raw = requested
            .min(motor_max_raw)
            .min(f64::from(CONTROLLER_MAX_RAW_CURRENT))
            .max(0.0);

        Ok(raw as u8)
    }

    pub fn to_amps(&self, raw: i64) -> f64 {
        let amps = raw as f64 * self.amps_per_step();
        (amps * 1000.0).round() / 1000.0
    }
}

/// A single framed command, without the terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(String);

impl Command {
    pub fn new(motor: Motor, opcode: Opcode) -> Self {
        Command(format!(":{}{}", motor, opcode.as_char()))
    }

    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        use fmt::Write;
        let _ = write!(self.0, "{value}");
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remove an echoed copy of the query from the start of a response
pub fn strip_echo<'a>(response: &'a str, query: &str) -> &'a str {
    let response = response.trim();
    response.strip_prefix(query).unwrap_or(response).trim()
}

pub fn parse_int(query: &str, payload: &str) -> Result<i64> {
    payload
        .parse()
        .map_err(|e| StageError::decode(query, payload, format!("expected integer ({e})")))
}

/// Parse a fixed-point integer payload; the error token reads as NaN
pub fn parse_scaled(query: &str, payload: &str, divisor: f64) -> Result<f64> {
    if payload == ERROR_TOKEN {
        return Ok(f64::NAN);
    }
    Ok(parse_int(query, payload)? as f64 / divisor)
}

/// Parse a string of single-digit flags such as "01001"
pub fn parse_digits(query: &str, payload: &str) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(StageError::decode(query, payload, "empty response"));
    }
    payload
        .chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as u8)
                .ok_or_else(|| StageError::decode(query, payload, format!("unexpected {c:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_format() {
        let cmd = Command::new(Motor::X, Opcode::Speed).arg(1200);
        assert_eq!(cmd.as_str(), ":1s1200");

        let sp = SetPointIndex::try_from(7).unwrap();
        let cmd = Command::new(Motor::Y, Opcode::SetPoint(sp));
        assert_eq!(cmd.as_str(), ":27");

        let cmd = Command::new(Motor::Both, Opcode::Halt).arg(StopKind::Hard.code());
        assert_eq!(cmd.as_str(), ":0h1");
    }

    #[test]
    fn test_motor_selection() {
        assert_eq!(Motor::try_from(0).unwrap(), Motor::Both);
        assert_eq!(Motor::try_from(2).unwrap(), Motor::Y);
        assert!(matches!(
            Motor::try_from(3),
            Err(StageError::InvalidArgument { name: "motor", .. })
        ));
        assert_eq!(Motor::axis(1).unwrap(), Motor::X);
        assert_eq!(Motor::axis(2).unwrap(), Motor::Y);
        // Every rejected axis names the single-axis domain
        for value in [0u8, 3, 255] {
            let err = Motor::axis(value).unwrap_err();
            assert!(matches!(err, StageError::InvalidArgument { name: "axis", .. }));
            assert_eq!(
                err.to_string(),
                format!("Invalid axis: received {value}, expected one of [1, 2]")
            );
        }
    }

    #[test]
    fn test_opcode_outputs_and_inputs() {
        assert_eq!(Opcode::OutputState(Output::Two).as_char(), 'n');
        assert_eq!(Opcode::OutputConfig(Output::One).as_char(), 'J');
        assert_eq!(Opcode::InputConfig(Input::Four).as_char(), 'W');
        assert!(Output::try_from(3).is_err());
        assert!(Input::try_from(0).is_err());
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo(":1p12345\r", ":1p"), "12345");
        assert_eq!(strip_echo("12345", ":1p"), "12345");
        assert_eq!(strip_echo("  -42 \r\n", ":2y"), "-42");
    }

    #[test]
    fn test_direction_mapping() {
        assert_eq!("CW".parse::<Direction>().unwrap().code(), 0);
        assert_eq!("ccw".parse::<Direction>().unwrap().code(), 1);
        assert!("up".parse::<Direction>().is_err());
        assert_eq!(Direction::from_code("1"), Some(Direction::Ccw));
        assert_eq!(Direction::from_code("7"), None);
    }

    #[test]
    fn test_baud_mapping() {
        assert_eq!(BaudRate::try_from(9600).unwrap().code(), 1);
        assert_eq!(BaudRate::try_from(115_200).unwrap().code(), 5);
        let err = BaudRate::try_from(1200).unwrap_err();
        assert!(err.to_string().contains("115200"));
        assert_eq!(BaudRate::from_code("0"), Some(None));
        assert_eq!(BaudRate::from_code("3"), Some(Some(BaudRate::B38400)));
        assert_eq!(BaudRate::from_code("9"), None);
    }

    #[test]
    fn test_address() {
        assert_eq!("7".parse::<Address>().unwrap().as_char(), '7');
        assert_eq!("b".parse::<Address>().unwrap().as_char(), 'B');
        assert!("G".parse::<Address>().is_err());
        assert!("10".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn test_encoder_cpr() {
        assert_eq!(check_encoder_cpr(8192).unwrap(), 8192);
        assert!(check_encoder_cpr(8191).is_err());
    }

    #[test]
    fn test_current_clamp() {
        let scale = CurrentScale::new(CurrentRange::Low, 0.62);
        let step = 1.0_f64 / 31.0;
        let expected = ((0.62 / step).round()).min((0.62 / step).floor()) as u8;
        assert_eq!(scale.to_raw(0.62).unwrap(), expected);
        assert_eq!(expected, 19);

        // Requests above the motor rating are clamped, not transmitted as-is
        assert_eq!(scale.to_raw(5.0).unwrap(), 19);
        assert_eq!(scale.to_raw(0.0).unwrap(), 0);
        assert!(scale.to_raw(-0.1).is_err());
        assert!(scale.to_raw(f64::NAN).is_err());

        // Controller ceiling applies even for an oversized motor rating
        let scale = CurrentScale::new(CurrentRange::Low, 3.0);
        assert_eq!(scale.to_raw(3.0).unwrap(), CONTROLLER_MAX_RAW_CURRENT);
    }

    #[test]
    fn test_current_to_amps() {
        let scale = CurrentScale::new(CurrentRange::High, 0.62);
        assert_eq!(scale.to_amps(31), 2.0);
        assert_eq!(scale.to_amps(5), 0.323);
    }

    #[test]
    fn test_parse_payloads() {
        assert_eq!(parse_int(":1p", "12345").unwrap(), 12345);
        assert!(matches!(
            parse_int(":1p", ""),
            Err(StageError::Decode { .. })
        ));
        assert!(parse_scaled(":1x", "!", 10.0).unwrap().is_nan());
        assert_eq!(parse_scaled(":1x", "1805", 10.0).unwrap(), 180.5);
        assert_eq!(parse_digits(":1l", "01001").unwrap(), vec![0, 1, 0, 0, 1]);
        assert!(parse_digits(":1l", "0x").is_err());
    }

    #[test]
    fn test_check_range_bounds() {
        assert_eq!(check_range("speed", 0, &RATE_RANGE).unwrap(), 0);
        assert_eq!(check_range("speed", 65_535, &RATE_RANGE).unwrap(), 65_535);
        let err = check_range("speed", 65_536, &RATE_RANGE).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid speed: received 65536, expected 0 to 65535"
        );
    }
}
