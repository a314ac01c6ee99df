// Synchronous-stepping state machine.
//
// Stepping is a global property of the simulation, not of a session, so the
// server owns exactly one `SteppingMachine`. It only tracks state; the
// server performs the side effects (pausing the world, applying controls,
// registering capture callbacks, answering clients) around each transition.
//
//   Continuous ──activate──▶ Idle ──advance──▶ Advance
//        ▲                    │  ▲                 │ deadline reached
//        └─────deactivate─────┘  └─capture done── WaitForCapture
//
// Every transition checks its entry state and refuses with `WrongState`
// otherwise, leaving the machine untouched. No state is ever skipped.
//
// Advance requests carry a client-chosen time step. Steps longer than
// `MAX_TIME_STEP`, or whose deadline the clock cannot represent, are refused
// like any other invalid advance, leaving the machine in Idle.
//
// The client whose advance is in flight is remembered by `ClientId` and
// resolved through the registry when the capture completes, so a client that
// disconnects mid-step leaves nothing dangling.

use std::time::{Duration, Instant};

use drivelink_protocol::ClientId;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SteppingState {
    /// The simulation runs in real time.
    Continuous,
    /// Paused, waiting for the master's next advance.
    Idle,
    /// Unpaused for one step until the advance deadline passes.
    Advance,
    /// Paused again, waiting for the step's capture to finish.
    WaitForCapture,
}

impl SteppingState {
    /// Whether the update tick drains protocol messages in this state.
    pub fn accepts_messages(self) -> bool {
        matches!(self, SteppingState::Continuous | SteppingState::Idle)
    }
}

/// Longest step a single advance may request.
pub const MAX_TIME_STEP: Duration = Duration::from_secs(3600);

/// A transition was requested from the wrong state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("stepping transition not allowed in state {actual:?}")]
pub struct WrongState {
    pub actual: SteppingState,
}

/// Why an advance was refused.
#[derive(Clone, Copy, Debug, PartialEq, Error)]
pub enum AdvanceError {
    #[error(transparent)]
    WrongState(#[from] WrongState),

    #[error("time step {time_step} is outside 0..={max:?}")]
    StepOutOfRange { time_step: f32, max: Duration },

    #[error("advance deadline overflows the clock")]
    DeadlineOverflow,
}

#[derive(Debug)]
pub struct SteppingMachine {
    state: SteppingState,
    stepping_client: Option<ClientId>,
    advance_end: Option<Instant>,
}

impl Default for SteppingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SteppingMachine {
    pub fn new() -> Self {
        Self {
            state: SteppingState::Continuous,
            stepping_client: None,
            advance_end: None,
        }
    }

    pub fn state(&self) -> SteppingState {
        self.state
    }

    /// The client whose advance is in flight, if any.
    pub fn stepping_client(&self) -> Option<ClientId> {
        self.stepping_client
    }

    /// When the current advance ends. Only set in `Advance`.
    pub fn advance_deadline(&self) -> Option<Instant> {
        self.advance_end
    }

    /// Continuous → Idle.
    pub fn activate(&mut self) -> Result<(), WrongState> {
        self.expect(SteppingState::Continuous)?;
        self.state = SteppingState::Idle;
        Ok(())
    }

    /// Idle → Continuous.
    pub fn deactivate(&mut self) -> Result<(), WrongState> {
        self.expect(SteppingState::Idle)?;
        self.state = SteppingState::Continuous;
        Ok(())
    }

    /// Idle → Advance, recording `client` and the deadline `now + step`.
    pub fn advance(
        &mut self,
        client: ClientId,
        now: Instant,
        step: Duration,
    ) -> Result<(), AdvanceError> {
        self.expect(SteppingState::Idle)?;
        let end = now
            .checked_add(step)
            .ok_or(AdvanceError::DeadlineOverflow)?;
        self.stepping_client = Some(client);
        self.advance_end = Some(end);
        self.state = SteppingState::Advance;
        Ok(())
    }

    /// Advance → WaitForCapture once `now` reaches the deadline. Returns
    /// true if the transition happened.
    pub fn poll_deadline(&mut self, now: Instant) -> bool {
        match (self.state, self.advance_end) {
            (SteppingState::Advance, Some(end)) if now >= end => {
                self.state = SteppingState::WaitForCapture;
                self.advance_end = None;
                true
            }
            _ => false,
        }
    }

    /// WaitForCapture → Idle. Hands back the client that requested the step.
    pub fn capture_finished(&mut self) -> Result<Option<ClientId>, WrongState> {
        self.expect(SteppingState::WaitForCapture)?;
        self.state = SteppingState::Idle;
        Ok(self.stepping_client.take())
    }

    /// Back to the initial state (used when a proxy registers).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn expect(&self, required: SteppingState) -> Result<(), WrongState> {
        if self.state == required {
            Ok(())
        } else {
            Err(WrongState { actual: self.state })
        }
    }
}

/// Convert a client-supplied time step to a duration. Negative and NaN
/// steps become zero; steps above `MAX_TIME_STEP` (including infinity) are
/// out of range.
pub fn step_duration(time_step: f32) -> Result<Duration, AdvanceError> {
    if time_step.is_nan() || time_step <= 0.0 {
        return Ok(Duration::ZERO);
    }
    match Duration::try_from_secs_f32(time_step) {
        Ok(step) if step <= MAX_TIME_STEP => Ok(step),
        _ => Err(AdvanceError::StepOutOfRange {
            time_step,
            max: MAX_TIME_STEP,
        }),
    }
}
