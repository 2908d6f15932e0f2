//! Bounded state machine for submit/poll report jobs.
//!
//! `Pending -> Polling { polls } -> Complete | TimedOut { polls }`. The
//! machine never sleeps or performs I/O itself; the Fetcher feeds it one
//! observation per response, which keeps termination easy to test.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Re-polls allowed after the initial submit.
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Job submitted, no response observed yet.
    Pending,
    /// Job still running; `polls` re-polls have been issued so far.
    Polling { polls: u32 },
    Complete,
    TimedOut { polls: u32 },
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PollState::Complete | PollState::TimedOut { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PollMachine {
    policy: PollPolicy,
    state: PollState,
}

impl PollMachine {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            state: PollState::Pending,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Feeds the completion flag of the latest response and returns the new
    /// state. `Polling` means the caller should wait one interval and poll
    /// again. Terminal states are sticky.
    pub fn observe(&mut self, complete: bool) -> PollState {
        self.state = match self.state {
            terminal @ (PollState::Complete | PollState::TimedOut { .. }) => terminal,
            _ if complete => PollState::Complete,
            PollState::Pending if self.policy.max_polls == 0 => PollState::TimedOut { polls: 0 },
            PollState::Pending => PollState::Polling { polls: 1 },
            PollState::Polling { polls } if polls >= self.policy.max_polls => {
                PollState::TimedOut { polls }
            }
            PollState::Polling { polls } => PollState::Polling { polls: polls + 1 },
        };
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn machine(max_polls: u32) -> PollMachine {
        PollMachine::new(PollPolicy {
            interval: Duration::ZERO,
            max_polls,
        })
    }

    #[test]
    fn immediate_completion_skips_polling() {
        let mut m = machine(3);
        assert_eq!(m.state(), PollState::Pending);
        assert_eq!(m.observe(true), PollState::Complete);
    }

    #[test]
    fn completes_after_some_polls() {
        let mut m = machine(3);
        assert_eq!(m.observe(false), PollState::Polling { polls: 1 });
        assert_eq!(m.observe(false), PollState::Polling { polls: 2 });
        assert_eq!(m.observe(true), PollState::Complete);
    }

    #[test]
    fn never_completing_job_times_out_after_budget() {
        let mut m = machine(3);
        let mut requests = 0;
        while !m.state().is_terminal() {
            requests += 1;
            m.observe(false);
            assert!(requests <= 10, "machine must terminate");
        }
        assert_eq!(m.state(), PollState::TimedOut { polls: 3 });
        // one submit plus three re-polls
        assert_eq!(requests, 4);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut m = machine(0);
        assert_eq!(m.observe(false), PollState::TimedOut { polls: 0 });
        assert_eq!(m.observe(true), PollState::TimedOut { polls: 0 });
    }
}
