//! Debounce/coalesce state machine for outgoing chat turns.
//!
//! Pure and clock-free: the caller owns the timers and feeds their expiry back
//! in with the epoch they were armed for. A timer whose epoch no longer matches
//! was superseded by a later user message and is ignored.

use std::time::Duration;

/// Where the dispatcher currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Nothing queued, nothing streaming.
    Idle,
    /// Waiting out the quiet period armed with `epoch`.
    Debouncing { epoch: u64 },
    /// One cycle is streaming.
    Running,
    /// One cycle is streaming and more user input arrived meanwhile.
    RunningWithPending,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    None,
    /// Call back [`DispatchMachine::on_timer`] with `epoch` after `delay`.
    ArmTimer { epoch: u64, delay: Duration },
    /// Send the whole conversation as one turn.
    StartCycle,
}

#[derive(Debug)]
pub struct DispatchMachine {
    state: DispatchState,
    epoch: u64,
    debounce: Duration,
    followup: Duration,
}

impl DispatchMachine {
    #[must_use]
    pub fn new(debounce: Duration, followup: Duration) -> Self {
        Self {
            state: DispatchState::Idle,
            epoch: 0,
            debounce,
            followup,
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    fn arm(&mut self, delay: Duration) -> DispatchAction {
        self.epoch += 1;
        self.state = DispatchState::Debouncing { epoch: self.epoch };
        DispatchAction::ArmTimer {
            epoch: self.epoch,
            delay,
        }
    }

    /// A user message was appended to the conversation.
    pub fn on_user_message(&mut self) -> DispatchAction {
        match self.state {
            DispatchState::Idle | DispatchState::Debouncing { .. } => self.arm(self.debounce),
            DispatchState::Running | DispatchState::RunningWithPending => {
                self.state = DispatchState::RunningWithPending;
                DispatchAction::None
            }
        }
    }

    /// The timer armed for `epoch` fired; `pending` is the number of user
    /// messages after the latest assistant message.
    pub fn on_timer(&mut self, epoch: u64, pending: usize) -> DispatchAction {
        match self.state {
            DispatchState::Debouncing { epoch: current } if current == epoch => {
                if pending == 0 {
                    self.state = DispatchState::Idle;
                    DispatchAction::None
                } else {
                    self.state = DispatchState::Running;
                    DispatchAction::StartCycle
                }
            }
            _ => DispatchAction::None,
        }
    }

    /// The running cycle ended, however it ended.
    pub fn on_cycle_finished(&mut self) -> DispatchAction {
        match self.state {
            DispatchState::RunningWithPending => self.arm(self.followup),
            DispatchState::Running => {
                self.state = DispatchState::Idle;
                DispatchAction::None
            }
            DispatchState::Idle | DispatchState::Debouncing { .. } => DispatchAction::None,
        }
    }

    /// Drop any queued dispatch. A running cycle still reports its finish,
    /// which then returns the machine to idle.
    pub fn on_stop(&mut self) {
        match self.state {
            DispatchState::Debouncing { .. } => {
                self.epoch += 1;
                self.state = DispatchState::Idle;
            }
            DispatchState::RunningWithPending => self.state = DispatchState::Running,
            DispatchState::Idle | DispatchState::Running => {}
        }
    }
}
