//! Per-step state machine
//!
//! A pure transition function: no I/O, no clocks, no randomness. The
//! orchestrator feeds it events as the agents report back and executes the
//! actions it returns. Every step walks
//! Pending -> ContextRetrieved -> Generated -> TestValidated ->
//! SecurityChecked -> BuildChecked -> RiskScored and ends in exactly one of
//! Accepted, Rejected, or RolledBack.
//!
//! Failed test or build validation re-enters generation with a fresh
//! attempt while the attempt budget lasts. A blocking security finding or an
//! unrecoverable build break goes straight to Rejected. An event that makes
//! no sense in the current state
//! fails closed into Rejected rather than panicking.

use forge_core::RejectReason;

/// Where a step currently is in its lifecycle
///
/// Generation attempts are carried in the state so the bounded-regeneration
/// decision is a property of the machine, not of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    Pending,
    ContextRetrieved,
    Generated(usize),
    TestValidated(usize),
    SecurityChecked(usize),
    BuildChecked(usize),
    RiskScored,
    Accepted,
    Rejected(RejectReason),
    RolledBack,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected(_) | Self::RolledBack)
    }
}

/// What happened, as reported by the agents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// Context bundle ready (possibly empty)
    ContextReady,
    /// A patch and its test artifact were produced; payload is the 1-based
    /// attempt number
    PatchReady(usize),
    /// Generation failed with no attempt budget left
    GenerationFailed,
    TestsPassed,
    TestsFailed,
    /// Security gate finished without a blocking finding
    SecurityClean,
    /// Security gate produced a blocking finding
    SecurityBlocked,
    BuildClean,
    /// Build failed in a way the next attempt can address
    BuildFailed,
    /// Build failed with an unrecoverable break; no retry
    BuildBlocked,
    RiskReady,
    Accept,
    Rollback,
}

/// What the orchestrator must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RetrieveContext,
    /// Generate (or regenerate) a patch; payload is the attempt number
    GeneratePatch(usize),
    RunGates,
    ScoreRisk,
    RecordOutcome,
    /// Stop executing the plan; no later step may start
    HaltPlan,
}

pub struct StepMachine {
    max_attempts: usize,
}

impl StepMachine {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Initial state and the action that starts the step
    pub fn start(&self) -> (StepState, Vec<Action>) {
        (StepState::Pending, vec![Action::RetrieveContext])
    }

    pub fn transition(&self, state: StepState, event: StepEvent) -> (StepState, Vec<Action>) {
        use Action::*;
        use StepEvent as E;
        use StepState as S;

        match (state, event) {
            (S::Pending, E::ContextReady) => (S::ContextRetrieved, vec![GeneratePatch(1)]),

            (S::ContextRetrieved, E::PatchReady(n)) => (S::Generated(n), vec![]),
            (S::ContextRetrieved, E::GenerationFailed) => (
                S::Rejected(RejectReason::GenerationExhausted),
                vec![RecordOutcome, HaltPlan],
            ),

            (S::Generated(n), E::TestsPassed) => (S::TestValidated(n), vec![RunGates]),
            (S::Generated(n), E::TestsFailed) => self.retry_or_reject(n),

            (S::TestValidated(n), E::SecurityClean) => (S::SecurityChecked(n), vec![]),
            (S::TestValidated(_), E::SecurityBlocked) => (
                S::Rejected(RejectReason::BlockingFinding),
                vec![RecordOutcome, HaltPlan],
            ),

            (S::SecurityChecked(n), E::BuildClean) => (S::BuildChecked(n), vec![ScoreRisk]),
            (S::SecurityChecked(n), E::BuildFailed) => self.retry_or_reject(n),
            (S::SecurityChecked(_), E::BuildBlocked) => (
                S::Rejected(RejectReason::BlockingFinding),
                vec![RecordOutcome, HaltPlan],
            ),

            (S::BuildChecked(_), E::RiskReady) => (S::RiskScored, vec![]),

            (S::RiskScored, E::Accept) => (S::Accepted, vec![RecordOutcome]),

            // Post-acceptance compensation is the one exit from a terminal
            // state
            (S::Accepted, E::Rollback) => (S::RolledBack, vec![RecordOutcome]),

            // Remaining terminal states absorb everything
            (state @ (S::Rejected(_) | S::RolledBack), _) => (state, vec![]),
            (S::Accepted, _) => (S::Accepted, vec![]),

            // Fail closed: an out-of-order event rejects the step
            (state, event) => (
                S::Rejected(RejectReason::Internal(format!(
                    "invalid transition: {event:?} in {state:?}"
                ))),
                vec![RecordOutcome, HaltPlan],
            ),
        }
    }

    fn retry_or_reject(&self, attempt: usize) -> (StepState, Vec<Action>) {
        if attempt < self.max_attempts {
            (
                StepState::ContextRetrieved,
                vec![Action::GeneratePatch(attempt + 1)],
            )
        } else {
            (
                StepState::Rejected(RejectReason::GenerationExhausted),
                vec![Action::RecordOutcome, Action::HaltPlan],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Action::*;
    use StepEvent as E;
    use StepState as S;

    fn machine() -> StepMachine {
        StepMachine::new(3)
    }

    #[test]
    fn test_happy_path_to_accepted() {
        let m = machine();
        let (state, actions) = m.start();
        assert_eq!(state, S::Pending);
        assert_eq!(actions, vec![RetrieveContext]);

        let (state, actions) = m.transition(state, E::ContextReady);
        assert_eq!(state, S::ContextRetrieved);
        assert_eq!(actions, vec![GeneratePatch(1)]);

        let (state, _) = m.transition(state, E::PatchReady(1));
        assert_eq!(state, S::Generated(1));

        let (state, actions) = m.transition(state, E::TestsPassed);
        assert_eq!(state, S::TestValidated(1));
        assert_eq!(actions, vec![RunGates]);

        let (state, _) = m.transition(state, E::SecurityClean);
        assert_eq!(state, S::SecurityChecked(1));

        let (state, actions) = m.transition(state, E::BuildClean);
        assert_eq!(state, S::BuildChecked(1));
        assert_eq!(actions, vec![ScoreRisk]);

        let (state, _) = m.transition(state, E::RiskReady);
        assert_eq!(state, S::RiskScored);

        let (state, actions) = m.transition(state, E::Accept);
        assert_eq!(state, S::Accepted);
        assert_eq!(actions, vec![RecordOutcome]);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failed_tests_regenerate_within_budget() {
        let m = machine();

        let (state, actions) = m.transition(S::Generated(1), E::TestsFailed);
        assert_eq!(state, S::ContextRetrieved);
        assert_eq!(actions, vec![GeneratePatch(2)]);

        let (state, actions) = m.transition(S::Generated(2), E::TestsFailed);
        assert_eq!(state, S::ContextRetrieved);
        assert_eq!(actions, vec![GeneratePatch(3)]);
    }

    #[test]
    fn test_attempt_budget_exhaustion_rejects() {
        let m = machine();

        let (state, actions) = m.transition(S::Generated(3), E::TestsFailed);
        assert_eq!(state, S::Rejected(RejectReason::GenerationExhausted));
        assert!(actions.contains(&HaltPlan));
    }

    #[test]
    fn test_build_failure_uses_same_budget() {
        let m = machine();

        let (state, actions) = m.transition(S::SecurityChecked(2), E::BuildFailed);
        assert_eq!(state, S::ContextRetrieved);
        assert_eq!(actions, vec![GeneratePatch(3)]);

        let (state, _) = m.transition(S::SecurityChecked(3), E::BuildFailed);
        assert_eq!(state, S::Rejected(RejectReason::GenerationExhausted));
    }

    #[test]
    fn test_blocking_finding_rejects_immediately() {
        let m = machine();

        let (state, actions) = m.transition(S::TestValidated(1), E::SecurityBlocked);
        assert_eq!(state, S::Rejected(RejectReason::BlockingFinding));
        assert!(actions.contains(&HaltPlan));
    }

    #[test]
    fn test_unrecoverable_build_break_rejects_without_retry() {
        let m = machine();

        let (state, actions) = m.transition(S::SecurityChecked(1), E::BuildBlocked);
        assert_eq!(state, S::Rejected(RejectReason::BlockingFinding));
        assert!(actions.contains(&HaltPlan));
    }

    #[test]
    fn test_generation_failure_rejects() {
        let m = machine();

        let (state, _) = m.transition(S::ContextRetrieved, E::GenerationFailed);
        assert_eq!(state, S::Rejected(RejectReason::GenerationExhausted));
    }

    #[test]
    fn test_accepted_step_can_roll_back() {
        let m = machine();

        let (state, actions) = m.transition(S::Accepted, E::Rollback);
        assert_eq!(state, S::RolledBack);
        assert_eq!(actions, vec![RecordOutcome]);
    }

    #[test]
    fn test_terminal_states_absorb_other_events() {
        let m = machine();

        let rejected = S::Rejected(RejectReason::BlockingFinding);
        let (state, actions) = m.transition(rejected.clone(), E::TestsPassed);
        assert_eq!(state, rejected);
        assert!(actions.is_empty());

        let (state, actions) = m.transition(S::Accepted, E::BuildFailed);
        assert_eq!(state, S::Accepted);
        assert!(actions.is_empty());

        let (state, _) = m.transition(S::RolledBack, E::Rollback);
        assert_eq!(state, S::RolledBack);
    }

    #[test]
    fn test_out_of_order_event_fails_closed() {
        let m = machine();

        let (state, actions) = m.transition(S::Pending, E::BuildClean);
        assert!(matches!(state, S::Rejected(RejectReason::Internal(_))));
        assert!(actions.contains(&HaltPlan));
    }

    #[test]
    fn test_attempt_budget_never_below_one() {
        let m = StepMachine::new(0);
        // Even a zero budget allows the first attempt to fail and reject,
        // not loop
        let (state, _) = m.transition(S::Generated(1), E::TestsFailed);
        assert_eq!(state, S::Rejected(RejectReason::GenerationExhausted));
    }
}
