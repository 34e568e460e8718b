// Typed values decoded from controller responses

use serde::{Deserialize, Serialize};

use crate::stage::protocol::{BaudRate, ConfigMode, CurrentRange, Direction};

/// A stored (position, velocity, acceleration) profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPoint {
    pub position: i64,
    pub velocity: i64,
    pub acceleration: i64,
}

/// Levels of the four digital inputs followed by the index line (1 = high)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStates {
    pub levels: Vec<u8>,
}

impl InputStates {
    /// Level of input `n` (1-based)
    pub fn input(&self, n: u8) -> Option<u8> {
        let idx = usize::from(n).checked_sub(1)?;
        self.levels.get(idx).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorCondition {
    Ready,
    NotHomed,
    NotInitialized,
    Error,
}

/// Decoded `g` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub run_state: RunState,
    pub condition: MotorCondition,
}

impl MotorStatus {
    pub fn from_codes(run_state: u8, condition: u8) -> Option<Self> {
        let run_state = match run_state {
            1 => RunState::Running,
            2 => RunState::Stopped,
            _ => return None,
        };
        let condition = match condition {
            0 => MotorCondition::Ready,
            1 => MotorCondition::NotHomed,
            2 => MotorCondition::NotInitialized,
            3 => MotorCondition::Error,
            _ => return None,
        };
        Some(Self {
            run_state,
            condition,
        })
    }
}

/// Snapshot of the settings an operator usually wants to see for one axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorReport {
    pub motor: u8,
    pub firmware: String,
    pub position: i64,
    pub encoder_count: i64,
    pub speed: i64,
    pub acceleration: i64,
    pub velocity: i64,
    pub nv_speed: i64,
    pub nv_acceleration: i64,
    pub microsteps: i64,
    pub direction: Direction,
    pub current_range: CurrentRange,
    pub holding_current: f64,
    pub run_current: f64,
    pub load_error: i64,
    pub homing_load_error: i64,
    pub encoder_cpr: i64,
    pub index_config: ConfigMode,
    #[serde(with = "baud_serde")]
    pub baud: Option<BaudRate>,
    pub status: MotorStatus,
    pub inputs: InputStates,
}

mod baud_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::stage::protocol::BaudRate;

    pub fn serialize<S: Serializer>(baud: &Option<BaudRate>, s: S) -> Result<S::Ok, S::Error> {
        baud.map(BaudRate::bits_per_second).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<BaudRate>, D::Error> {
        Option::<u32>::deserialize(d)?
            .map(|bps| BaudRate::try_from(bps).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_lookup() {
        let states = InputStates {
            levels: vec![0, 1, 0, 0, 1],
        };
        assert_eq!(states.input(2), Some(1));
        assert_eq!(states.input(1), Some(0));
        assert_eq!(states.input(0), None);
        assert_eq!(states.input(9), None);
    }

    #[test]
    fn test_motor_status_codes() {
        let status = MotorStatus::from_codes(2, 1).unwrap();
        assert_eq!(status.run_state, RunState::Stopped);
        assert_eq!(status.condition, MotorCondition::NotHomed);
        assert!(MotorStatus::from_codes(0, 0).is_none());
        assert!(MotorStatus::from_codes(1, 4).is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let status = MotorStatus::from_codes(1, 2).unwrap();
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(
            json,
            r#"{"run_state":"running","condition":"not_initialized"}"#
        );
    }
}
