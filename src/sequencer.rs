//! Motion sequencing state machine.
//!
//! A [`MotionSequencer`] owns the link to one device. A motion command is
//! compiled into an ordered list of register writes, issued one per
//! [`MotionSequencer::step`], and followed by a bounded poll of the device's
//! run-status register.
//!
//! ```text
//! Idle --start--> Configuring(0) --write ok--> Configuring(i+1) ... Configuring(last)
//!     Configuring(last) --direction != stop--> AwaitingStop(0)
//!     Configuring(last) --direction == stop--> Stopped
//!     AwaitingStop(n) --status != 0, n < max--> AwaitingStop(n+1)
//!     AwaitingStop(n) --status == 0--> Stopped
//!     AwaitingStop(max) --> TimedOut
//!     any write/transport failure or exception reply --> Failed(reason)
//! ```

use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::SequencerConfig;
use crate::registers::{
    DeviceModel, Parameter, RegisterMap, RegisterWrite, Segment, parameter_name,
};
use crate::transport::{Framing, ModbusLink, Transport};
use crate::{ModbusError, Request};

/// Work mode M20: position run driven by the pulse registers.
pub const ZS_PULSE_MODE: u16 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    /// Index of the next planned write.
    Configuring(usize),
    /// Status polls made so far.
    AwaitingStop(u32),
    Stopped,
    TimedOut,
    Failed(String),
}

impl MotionState {
    /// A sequence is in flight and has not reached a final state.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Configuring(_) | Self::AwaitingStop(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Stopped | Self::TimedOut | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Stop,
    Forward,
    Reverse,
}

impl Direction {
    /// Run-control register value on pulse controllers.
    pub const fn run_code(self) -> i64 {
        match self {
            Self::Stop => 0,
            Self::Forward => 1,
            Self::Reverse => 2,
        }
    }
}

/// Pulse-train run on a ZS controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRun {
    pub direction: Direction,
    /// Hz, 1..=30000.
    pub frequency: u16,
    pub pulses: u32,
    /// Acceleration coefficient, 1..=100.
    pub accel: u8,
    #[serde(default = "default_pulse_mode")]
    pub mode: u16,
}

fn default_pulse_mode() -> u16 {
    ZS_PULSE_MODE
}

impl PulseRun {
    pub fn new(direction: Direction, frequency: u16, pulses: u32, accel: u8) -> Self {
        Self {
            direction,
            frequency,
            pulses,
            accel,
            mode: ZS_PULSE_MODE,
        }
    }
}

/// Single-segment profile on a DS5L2 drive.
///
/// The profile is written to segment `start_segment + 1` and triggered through
/// the communication segment register. `position` is a distance; `Reverse`
/// negates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentProfile {
    pub start_segment: u8,
    pub valid_segments: u8,
    pub position: i64,
    /// 0.1 rpm units.
    pub speed: u16,
    pub accel_time: u16,
    pub dec_time: u16,
    #[serde(default)]
    pub adjust_time: Option<u16>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionCommand {
    PulseRun(PulseRun),
    SegmentProfile(SegmentProfile),
    Enable(bool),
    ClearAlarm,
}

impl MotionCommand {
    /// Commands that physically move the axis and need a confirmed stop first.
    pub fn moves(&self) -> bool {
        match self {
            Self::PulseRun(run) => run.direction != Direction::Stop,
            Self::SegmentProfile(profile) => profile.direction != Direction::Stop,
            Self::Enable(_) | Self::ClearAlarm => false,
        }
    }
}

/// How a finished sequence ended, short of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stopped,
    /// The device still reported motion after `attempts` polls.
    TimedOut { attempts: u32 },
}

/// Receives sequencer events. Every method defaults to doing nothing.
pub trait MotionObserver {
    fn on_transition(&mut self, _from: &MotionState, _to: &MotionState) {}

    fn on_write(&mut self, _parameter: Parameter, _request: &Request) {}

    /// `status` carries the error when the reply was malformed or did not
    /// echo the read. Such a poll still counts as an attempt.
    fn on_poll(&mut self, _attempt: u32, _status: Result<u16, &ModbusError>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Poll,
    Immediate,
}

#[derive(Debug, Clone)]
struct Plan {
    writes: Vec<RegisterWrite>,
    finish: Finish,
}

/// Drives one device through motion sequences.
///
/// The sequencer owns its [`ModbusLink`] and therefore its transport; a port
/// cannot be driven by two sequencers at once.
pub struct MotionSequencer<T> {
    link: ModbusLink<T>,
    map: RegisterMap,
    config: SequencerConfig,
    state: MotionState,
    plan: Option<Plan>,
    observer: Option<Box<dyn MotionObserver + Send>>,
}

impl<T: Transport> MotionSequencer<T> {
    pub fn new(link: ModbusLink<T>, model: DeviceModel, config: SequencerConfig) -> Self {
        Self {
            link,
            map: RegisterMap::for_model(model),
            config,
            state: MotionState::Idle,
            plan: None,
            observer: None,
        }
    }

    /// Builds the link from `config.slave` and `config.response_timeout()`.
    pub fn with_transport(
        transport: T,
        framing: Framing,
        model: DeviceModel,
        config: SequencerConfig,
    ) -> Self {
        let link = ModbusLink::new(transport, framing, config.slave, config.response_timeout());
        Self::new(link, model, config)
    }

    pub fn with_observer(mut self, observer: impl MotionObserver + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> &MotionState {
        &self.state
    }

    pub fn model(&self) -> DeviceModel {
        self.map.model()
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn link(&self) -> &ModbusLink<T> {
        &self.link
    }

    pub fn into_link(self) -> ModbusLink<T> {
        self.link
    }

    /// Validates and plans `command`, forces a stop for motion commands, and
    /// enters `Configuring(0)`.
    ///
    /// Rejected with `InvalidState` while a sequence is in flight. Every value
    /// is range-checked before anything is sent.
    pub fn start(&mut self, command: MotionCommand) -> Result<(), ModbusError> {
        if self.state.is_busy() {
            return Err(ModbusError::InvalidState(self.state.clone()));
        }
        let plan = self.plan(&command)?;
        info!(
            "{:?}: starting {:?} with {} writes",
            self.map.model(),
            command,
            plan.writes.len()
        );

        if command.moves() {
            if let Outcome::TimedOut { attempts } = self.stop()? {
                return Err(ModbusError::TimedOut { attempts });
            }
        }

        self.plan = Some(plan);
        self.transition(MotionState::Configuring(0));
        Ok(())
    }

    /// Performs one transition. Does nothing in `Idle` or a final state.
    pub fn step(&mut self) -> Result<(), ModbusError> {
        match self.state {
            MotionState::Configuring(index) => self.configure(index),
            MotionState::AwaitingStop(attempts) => self.poll(attempts),
            _ => Ok(()),
        }
    }

    /// Steps until the sequence finishes.
    pub fn run(&mut self) -> Result<Outcome, ModbusError> {
        if !self.state.is_busy() {
            return Err(ModbusError::InvalidState(self.state.clone()));
        }
        loop {
            match &self.state {
                MotionState::Stopped => return Ok(Outcome::Stopped),
                MotionState::TimedOut => {
                    return Ok(Outcome::TimedOut {
                        attempts: self.config.max_attempts,
                    });
                }
                MotionState::Failed(reason) => {
                    return Err(ModbusError::InvalidState(MotionState::Failed(reason.clone())));
                }
                _ => self.step()?,
            }
        }
    }

    /// `start` followed by `run`.
    pub fn execute(&mut self, command: MotionCommand) -> Result<Outcome, ModbusError> {
        self.start(command)?;
        self.run()
    }

    /// Writes the model's stop value and polls until the device reports idle.
    /// Any planned sequence is abandoned.
    pub fn stop(&mut self) -> Result<Outcome, ModbusError> {
        self.plan = None;
        let model = self.map.model();
        let write = self.map.encode(model.run_parameter(), None, model.stop_value())?;
        self.write(&write)?;
        self.transition(MotionState::AwaitingStop(0));
        self.run()
    }

    fn plan(&self, command: &MotionCommand) -> Result<Plan, ModbusError> {
        let map = &self.map;
        match command {
            MotionCommand::PulseRun(run) => Ok(Plan {
                writes: vec![
                    map.encode(Parameter::WorkMode, None, run.mode as i64)?,
                    map.encode(Parameter::AccelCoefficient, None, run.accel as i64)?,
                    map.encode(Parameter::PulseFrequency, None, run.frequency as i64)?,
                    map.encode(Parameter::PulseCount, None, run.pulses as i64)?,
                    map.encode(Parameter::RunControl, None, run.direction.run_code())?,
                ],
                finish: finish_for(run.direction),
            }),
            MotionCommand::SegmentProfile(profile) => {
                let segment = Segment::new(profile.start_segment.saturating_add(1))?;
                let seg = Some(segment);
                let position = match profile.direction {
                    Direction::Reverse => {
                        let (_, encoding) = map.resolve(Parameter::SegmentPosition, seg)?;
                        let what = parameter_name(Parameter::SegmentPosition);
                        encoding.check(what, profile.position)?;
                        -profile.position
                    }
                    Direction::Forward | Direction::Stop => profile.position,
                };
                let mut writes = vec![
                    map.encode(Parameter::ValidSegments, None, profile.valid_segments as i64)?,
                    map.encode(Parameter::StartSegment, None, profile.start_segment as i64)?,
                    map.encode(Parameter::SegmentPosition, seg, position)?,
                    map.encode(Parameter::SegmentSpeed, seg, profile.speed as i64)?,
                    map.encode(Parameter::SegmentAccelTime, seg, profile.accel_time as i64)?,
                    map.encode(Parameter::SegmentDecelTime, seg, profile.dec_time as i64)?,
                ];
                if let Some(adjust) = profile.adjust_time {
                    writes.push(map.encode(Parameter::SegmentAdjustTime, seg, adjust as i64)?);
                }
                let trigger = match profile.direction {
                    Direction::Stop => 0,
                    Direction::Forward | Direction::Reverse => segment.index() as i64,
                };
                writes.push(map.encode(Parameter::CommSegment, None, trigger)?);
                Ok(Plan {
                    writes,
                    finish: finish_for(profile.direction),
                })
            }
            MotionCommand::Enable(on) => Ok(Plan {
                writes: vec![map.encode(Parameter::Enable, None, i64::from(*on))?],
                finish: Finish::Immediate,
            }),
            MotionCommand::ClearAlarm => Ok(Plan {
                writes: vec![map.encode(Parameter::ClearAlarm, None, 1)?],
                finish: Finish::Immediate,
            }),
        }
    }

    fn configure(&mut self, index: usize) -> Result<(), ModbusError> {
        let Some(plan) = self.plan.as_ref() else {
            return Err(self.fail(ModbusError::InvalidState(self.state.clone())));
        };
        let Some(write) = plan.writes.get(index).cloned() else {
            return Err(self.fail(ModbusError::InvalidState(self.state.clone())));
        };
        let last = index + 1 == plan.writes.len();
        let finish = plan.finish;

        self.write(&write)?;

        if !last {
            self.transition(MotionState::Configuring(index + 1));
            return Ok(());
        }
        self.plan = None;
        match finish {
            Finish::Poll => self.transition(MotionState::AwaitingStop(0)),
            Finish::Immediate => self.transition(MotionState::Stopped),
        }
        Ok(())
    }

    fn poll(&mut self, attempts: u32) -> Result<(), ModbusError> {
        if attempts >= self.config.max_attempts {
            warn!(
                "{:?}: still running after {} status polls",
                self.map.model(),
                attempts
            );
            self.transition(MotionState::TimedOut);
            return Ok(());
        }

        let request = self.map.read_request(Parameter::RunStatus, None)?;
        let slave = self.link.slave();
        let status = match self
            .link
            .request(&request)
            .and_then(|response| request.check_response(slave, response))
        {
            Ok(response) => match response.value() {
                Some(value) => Ok(value),
                None => Err(ModbusError::UnmatchedEcho {
                    expected: request.expected_echo(slave),
                    received: response,
                }),
            },
            Err(err @ (ModbusError::Io(_) | ModbusError::Exception { .. })) => {
                return Err(self.fail(err));
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &status {
            warn!("unusable status reply: {err}");
        }

        let attempt = attempts + 1;
        debug!("status poll {attempt}: {status:?}");
        if let Some(observer) = self.observer.as_mut() {
            observer.on_poll(attempt, status.as_ref().copied());
        }

        if matches!(status, Ok(0)) {
            self.transition(MotionState::Stopped);
            return Ok(());
        }
        self.transition(MotionState::AwaitingStop(attempt));
        if attempt < self.config.max_attempts {
            thread::sleep(self.config.poll_interval());
        }
        Ok(())
    }

    /// One echoed register write followed by the settle delay.
    fn write(&mut self, write: &RegisterWrite) -> Result<(), ModbusError> {
        let request = write.to_request();
        if let Some(observer) = self.observer.as_mut() {
            observer.on_write(write.parameter, &request);
        }
        if let Err(err) = self.link.execute(&request) {
            return Err(self.fail(err));
        }
        thread::sleep(self.config.settle_delay());
        Ok(())
    }

    fn fail(&mut self, err: ModbusError) -> ModbusError {
        self.plan = None;
        self.transition(MotionState::Failed(err.to_string()));
        err
    }

    fn transition(&mut self, to: MotionState) {
        if to == self.state {
            return;
        }
        info!("{:?}: {:?} -> {:?}", self.map.model(), self.state, to);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_transition(&self.state, &to);
        }
        self.state = to;
    }
}

fn finish_for(direction: Direction) -> Finish {
    match direction {
        Direction::Stop => Finish::Immediate,
        Direction::Forward | Direction::Reverse => Finish::Poll,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_motion_needs_stop() {
        assert!(MotionCommand::PulseRun(PulseRun::new(Direction::Forward, 1000, 500, 1)).moves());
        assert!(!MotionCommand::PulseRun(PulseRun::new(Direction::Stop, 1000, 500, 1)).moves());
        assert!(!MotionCommand::Enable(true).moves());
        assert!(!MotionCommand::ClearAlarm.moves());
    }

    #[test]
    fn test_busy_states() {
        assert!(MotionState::Configuring(0).is_busy());
        assert!(MotionState::AwaitingStop(3).is_busy());
        assert!(!MotionState::Idle.is_busy());
        assert!(MotionState::TimedOut.is_finished());
    }
}
