// Homing and centering
//
// Homing drives an axis toward its negative travel limit until the limit
// switch input goes high, halts, backs off until the input drops again and
// then re-initializes the motor so the switch edge becomes position zero.
// The procedure blocks the calling thread. Cancellation is polled on every
// iteration and always sends a hard halt before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::driver::Stage;
use super::error::{Result, StageError};
use super::protocol::{
    check_range, Command, Motor, Opcode, StopKind, MAX_MOTOR_POSITION, RATE_RANGE,
};
use crate::config::{BACKOFF_STEPS, BACKOFF_VELOCITY, HOME_INPUT, POLL_INTERVAL, SETTLE_DELAY};

/// Source of delays for the polling loops
pub trait Clock: Send {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared flag used to interrupt a running homing procedure
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingState {
    NotHomed,
    SeekingLimit,
    LimitFound,
    BackingOff,
    Homed,
    Aborted,
}

/// Runs homing and centering for the two axes of a [`Stage`]
pub struct HomingController<C: Clock = SystemClock> {
    stage: Arc<Stage>,
    clock: C,
    states: [HomingState; 2],
}

impl HomingController<SystemClock> {
    pub fn new(stage: Arc<Stage>) -> Self {
        Self::with_clock(stage, SystemClock)
    }
}

impl<C: Clock> HomingController<C> {
    pub fn with_clock(stage: Arc<Stage>, clock: C) -> Self {
        Self {
            stage,
            clock,
            states: [HomingState::NotHomed; 2],
        }
    }

    fn slot(axis: Motor) -> usize {
        usize::from(axis.number()) - 1
    }

    pub fn state(&self, motor: u8) -> Result<HomingState> {
        Ok(self.states[Self::slot(Motor::axis(motor)?)])
    }

    pub fn is_homed(&self, motor: u8) -> bool {
        matches!(self.state(motor), Ok(HomingState::Homed))
    }

    fn transition(&mut self, axis: Motor, state: HomingState) {
        info!("Motor {} homing state: {:?}", axis, state);
        self.states[Self::slot(axis)] = state;
    }

    /// Home one axis. If `speed` is given and differs from the stored
    /// velocity, the new velocity is written first.
    pub fn home(&mut self, motor: u8, speed: Option<i64>, cancel: &CancelToken) -> Result<()> {
        let axis = Motor::axis(motor)?;
        if let Some(speed) = speed {
            check_range("speed", speed, &RATE_RANGE)?;
        }

        self.transition(axis, HomingState::NotHomed);

        let stored = self.stage.get_velocity(motor)?;
        let speed = speed.unwrap_or(stored);
        if speed != stored {
            info!("Motor {} velocity {} -> {} for homing", axis, stored, speed);
            self.stage.set_velocity(motor, speed)?;
        }

        match self.run_sequence(axis, cancel) {
            Ok(()) => {
                self.transition(axis, HomingState::Homed);
                info!("Motor {} homed", axis);
                Ok(())
            }
            Err(err @ StageError::Cancelled { .. }) => {
                warn!("User interrupted homing of motor {}. Sending HALT command", axis);
                self.transition(axis, HomingState::Aborted);
                self.stage.halt(motor, StopKind::Hard)?;
                info!("Motor {} halted", axis);
                Err(err)
            }
            Err(err) => {
                error!("Homing of motor {} failed: {}", axis, err);
                if let Err(halt_err) = self.stage.halt(motor, StopKind::Hard) {
                    warn!("Failed to halt motor {}: {}", axis, halt_err);
                }
                self.transition(axis, HomingState::NotHomed);
                Err(err)
            }
        }
    }

    fn run_sequence(&mut self, axis: Motor, cancel: &CancelToken) -> Result<()> {
        let motor = axis.number();

        self.transition(axis, HomingState::SeekingLimit);
        self.stage.goto_pos(motor, -MAX_MOTOR_POSITION)?;
        info!("Homing motor {}... cancel to emergency stop", axis);
        self.wait_for_input(axis, 1, cancel)?;

        self.stage.halt(motor, StopKind::Hard)?;
        self.transition(axis, HomingState::LimitFound);
        info!("Input {} switch activated", HOME_INPUT);

        self.clock.sleep(SETTLE_DELAY);
        self.stage.set_velocity(motor, BACKOFF_VELOCITY)?;
        self.stage.jog(motor, BACKOFF_STEPS)?;
        self.transition(axis, HomingState::BackingOff);
        self.wait_for_input(axis, 0, cancel)?;

        // Reset the position reading to zero at the switch edge
        self.stage.init_motor(motor)
    }

    /// Poll the home input until it reads `level`
    fn wait_for_input(&self, axis: Motor, level: u8, cancel: &CancelToken) -> Result<()> {
        let motor = axis.number();
        loop {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled { motor });
            }

            let states = self.stage.get_input_states(motor)?;
            let input = states.input(HOME_INPUT).ok_or_else(|| {
                let levels: String = states.levels.iter().map(u8::to_string).collect();
                StageError::decode(
                    Command::new(axis, Opcode::InputStates).as_str(),
                    &levels,
                    format!("missing input {HOME_INPUT}"),
                )
            })?;
            let position = self.stage.get_pos(motor)?;
            info!("Motor {}: input{} = {}, pos = {}", axis, HOME_INPUT, input, position);

            if input == level {
                return Ok(());
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    /// Send a homed axis to set point 0. Returns false, without touching the
    /// port, when the axis has not been homed.
    pub fn center(&self, motor: u8) -> Result<bool> {
        let axis = Motor::axis(motor)?;
        if !self.is_homed(motor) {
            info!("Motor {} not homed; not centering", axis);
            return Ok(false);
        }
        self.stage.goto_set_point(motor, 0)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::transport::mock::MockLink;
    use crate::stage::transport::Transport;
    use std::sync::Mutex;

    /// Records sleeps instead of sleeping; optionally cancels after N sleeps
    #[derive(Clone, Default)]
    struct FakeClock {
        sleeps: Arc<Mutex<Vec<Duration>>>,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl Clock for FakeClock {
        fn sleep(&self, duration: Duration) {
            let mut sleeps = self.sleeps.lock().unwrap();
            sleeps.push(duration);
            if let Some((n, token)) = &self.cancel_after {
                if sleeps.len() >= *n {
                    token.cancel();
                }
            }
        }
    }

    /// Link that answers velocity, position and input queries for motor 1.
    /// `inputs` is the sequence of `l` responses; the last one repeats.
    fn scripted_link(inputs: &'static [&'static str]) -> MockLink {
        let link = MockLink::new();
        let mut polls = 0usize;
        link.respond_with(move |query| match query {
            ":1v" => ":1v2000\r".to_string(),
            ":1p" => ":1p-150\r".to_string(),
            ":1l" => {
                let levels = inputs[polls.min(inputs.len() - 1)];
                polls += 1;
                format!(":1l{levels}\r")
            }
            _ => String::new(),
        });
        link
    }

    fn controller(link: &MockLink, clock: FakeClock) -> HomingController<FakeClock> {
        let transport = Transport::with_link(link.boxed());
        let stage = Arc::new(Stage::with_transport(transport, 0.62, true));
        HomingController::with_clock(stage, clock)
    }

    #[test]
    fn test_home_sequence() {
        let link = scripted_link(&["00000", "00000", "01000", "01000", "00001"]);
        let clock = FakeClock::default();
        let mut homing = controller(&link, clock.clone());

        homing.home(1, None, &CancelToken::new()).unwrap();

        assert!(homing.is_homed(1));
        assert_eq!(homing.state(1).unwrap(), HomingState::Homed);
        assert!(!homing.is_homed(2));
        assert_eq!(
            link.writes(),
            vec![
                ":1v",
                ":1p-2147000000",
                ":1l",
                ":1p",
                ":1l",
                ":1p",
                ":1l",
                ":1p",
                ":1h1",
                ":1v1000",
                ":1j5000",
                ":1l",
                ":1p",
                ":1l",
                ":1p",
                ":1i1",
            ]
        );
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![POLL_INTERVAL, POLL_INTERVAL, SETTLE_DELAY, POLL_INTERVAL]
        );
    }

    #[test]
    fn test_home_with_new_speed_updates_velocity() {
        let link = scripted_link(&["01000", "00000"]);
        let mut homing = controller(&link, FakeClock::default());

        homing.home(1, Some(3000), &CancelToken::new()).unwrap();
        let writes = link.writes();
        assert_eq!(&writes[..3], [":1v", ":1v3000", ":1p-2147000000"]);
    }

    #[test]
    fn test_home_with_same_speed_skips_velocity_write() {
        let link = scripted_link(&["01000", "00000"]);
        let mut homing = controller(&link, FakeClock::default());

        homing.home(1, Some(2000), &CancelToken::new()).unwrap();
        assert_eq!(&link.writes()[..2], [":1v", ":1p-2147000000"]);
    }

    #[test]
    fn test_cancel_while_seeking_halts_once() {
        let link = scripted_link(&["00000"]);
        let token = CancelToken::new();
        let clock = FakeClock {
            cancel_after: Some((2, token.clone())),
            ..Default::default()
        };
        let mut homing = controller(&link, clock);

        let err = homing.home(1, None, &token).unwrap_err();

        assert!(matches!(err, StageError::Cancelled { motor: 1 }));
        assert!(!homing.is_homed(1));
        assert_eq!(homing.state(1).unwrap(), HomingState::Aborted);
        let writes = link.writes();
        assert_eq!(writes.iter().filter(|w| w.starts_with(":1h")).count(), 1);
        assert_eq!(writes.last().map(String::as_str), Some(":1h1"));
        assert!(!writes.contains(&":1i1".to_string()));
    }

    #[test]
    fn test_cancel_while_backing_off_halts() {
        let link = scripted_link(&["01000", "01000"]);
        let token = CancelToken::new();
        // Sleep 1 is the settle delay, sleep 2 the first back-off poll
        let clock = FakeClock {
            cancel_after: Some((2, token.clone())),
            ..Default::default()
        };
        let mut homing = controller(&link, clock);

        let err = homing.home(1, None, &token).unwrap_err();
        assert!(matches!(err, StageError::Cancelled { .. }));
        assert_eq!(homing.state(1).unwrap(), HomingState::Aborted);
        assert_eq!(link.writes().last().map(String::as_str), Some(":1h1"));
    }

    #[test]
    fn test_home_rejects_both_motors_and_bad_speed() {
        let link = scripted_link(&["01000"]);
        let mut homing = controller(&link, FakeClock::default());

        assert!(matches!(
            homing.home(0, None, &CancelToken::new()),
            Err(StageError::InvalidArgument { .. })
        ));
        assert!(matches!(
            homing.home(1, Some(70_000), &CancelToken::new()),
            Err(StageError::InvalidArgument { .. })
        ));
        assert!(link.events().is_empty());
    }

    #[test]
    fn test_malformed_inputs_halt_and_fail() {
        let link = scripted_link(&["0"]);
        let mut homing = controller(&link, FakeClock::default());

        let err = homing.home(1, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StageError::Decode { .. }));
        assert_eq!(homing.state(1).unwrap(), HomingState::NotHomed);
        assert_eq!(link.writes().last().map(String::as_str), Some(":1h1"));
    }

    #[test]
    fn test_center_requires_homing() {
        let link = scripted_link(&["01000", "00000"]);
        let mut homing = controller(&link, FakeClock::default());

        assert!(!homing.center(1).unwrap());
        assert!(link.events().is_empty());

        homing.home(1, None, &CancelToken::new()).unwrap();
        assert!(homing.center(1).unwrap());
        assert_eq!(link.writes().last().map(String::as_str), Some(":1d0"));
    }

    #[test]
    fn test_cancel_token_reset() {
        let token = CancelToken::new();
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!shared.is_cancelled());
    }
}
