//! RDY distribution and the backoff state machine.
//!
//! Pure bookkeeping: nothing here talks to a connection. The consumer holds
//! a [`FlowState`] behind one async mutex, asks it for per-connection RDY
//! targets and applies them (decreases before increases, so the sum of RDY
//! never exceeds `max_in_flight` even mid-update).
//!
//! Phases:
//!
//! ```text
//!            failure                 timer fires
//!  Normal ─────────────► Waiting ─────────────► Probing
//!    ▲                     ▲                       │
//!    │  failures == 0      │ failure, or success   │
//!    └─────────────────────┴───────────────────────┘
//!                            with failures > 0
//! ```
//!
//! While `Waiting` every connection has RDY 0; while `Probing` exactly one
//! has RDY 1.

use std::time::Duration;

use rand::seq::IndexedRandom;

use crate::backoff::BackoffStrategy;

/// Split `max_in_flight` evenly over `conns` connections.
///
/// The remainder goes one each to the `max_in_flight % conns` connections
/// starting at `cursor`, wrapping around.
pub(crate) fn compute_targets(max_in_flight: u32, conns: usize, cursor: usize) -> Vec<u32> {
    if conns == 0 {
        return Vec::new();
    }
    let n = conns as u32;
    let base = max_in_flight / n;
    let remainder = (max_in_flight % n) as usize;
    let mut targets = vec![base; conns];
    for i in 0..remainder {
        targets[(cursor + i) % conns] += 1;
    }
    targets
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Normal,
    /// Backoff timer running; all RDY is 0.
    Waiting,
    /// One connection holds RDY 1 to test recovery.
    Probing,
}

/// Handler outcome as seen by the backoff state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
}

/// What the consumer must do after recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    /// Re-apply RDY targets.
    Redistribute,
    /// Zero all RDY and call [`FlowState::backoff_elapsed`] after `delay`.
    Backoff { delay: Duration, generation: u64 },
}

#[derive(Debug)]
pub(crate) struct FlowState {
    phase: Phase,
    failures: u32,
    /// Bumped on every backoff so that stale timers are ignored.
    generation: u64,
    cursor: usize,
    probe: Option<String>,
}

impl FlowState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Normal,
            failures: 0,
            generation: 0,
            cursor: 0,
            probe: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a handler outcome.
    ///
    /// Outcomes that arrive while the backoff timer runs are ignored; they
    /// belong to messages delivered before the backoff began. A zero
    /// `max_backoff` disables backoff entirely.
    pub(crate) fn record(&mut self, outcome: Outcome, strategy: &dyn BackoffStrategy, max_backoff: Duration) -> Action {
        if max_backoff.is_zero() || self.phase == Phase::Waiting {
            return Action::None;
        }
        match outcome {
            Outcome::Success => {
                if self.failures == 0 {
                    return Action::None;
                }
                self.failures -= 1;
                if self.failures == 0 {
                    self.phase = Phase::Normal;
                    self.probe = None;
                    Action::Redistribute
                } else {
                    self.enter_backoff(strategy.calculate(self.failures))
                }
            }
            Outcome::Failure => {
                // stop counting once the ceiling is reached
                if strategy.ceiling(self.failures) < max_backoff {
                    self.failures += 1;
                }
                self.enter_backoff(strategy.calculate(self.failures))
            }
        }
    }

    fn enter_backoff(&mut self, delay: Duration) -> Action {
        self.phase = Phase::Waiting;
        self.generation += 1;
        self.probe = None;
        Action::Backoff {
            delay,
            generation: self.generation,
        }
    }

    /// Backoff timer fired. Returns whether RDY must be re-applied.
    pub(crate) fn backoff_elapsed(&mut self, generation: u64) -> bool {
        if self.phase != Phase::Waiting || self.generation != generation {
            return false;
        }
        self.phase = Phase::Probing;
        true
    }

    /// RDY target for each connection, in the order of `addrs`.
    pub(crate) fn targets(&mut self, addrs: &[&str], max_in_flight: u32) -> Vec<u32> {
        match self.phase {
            Phase::Normal => compute_targets(max_in_flight, addrs.len(), self.cursor),
            Phase::Waiting => vec![0; addrs.len()],
            Phase::Probing => {
                let mut targets = vec![0; addrs.len()];
                if max_in_flight == 0 || addrs.is_empty() {
                    return targets;
                }
                let current = self
                    .probe
                    .as_deref()
                    .and_then(|p| addrs.iter().position(|a| *a == p));
                let index = match current {
                    Some(i) => i,
                    None => {
                        let chosen = addrs.choose(&mut rand::rng()).copied().unwrap_or_default();
                        self.probe = Some(chosen.to_string());
                        addrs.iter().position(|a| *a == chosen).unwrap_or(0)
                    }
                };
                targets[index] = 1;
                targets
            }
        }
    }

    /// Move credit away from idle connections.
    ///
    /// `conns` pairs each address (in the order later passed to
    /// [`targets`](Self::targets)) with whether it has been idle longer than
    /// the low-RDY idle timeout. Returns whether targets changed.
    pub(crate) fn redistribute(&mut self, conns: &[(&str, bool)], max_in_flight: u32) -> bool {
        let n = conns.len();
        if n < 2 {
            return false;
        }
        match self.phase {
            Phase::Normal => {
                let remainder = max_in_flight as usize % n;
                if max_in_flight as usize >= n || remainder == 0 {
                    return false;
                }
                let starved = (0..remainder).any(|i| conns[(self.cursor + i) % n].1);
                if starved {
                    self.cursor = (self.cursor + remainder) % n;
                }
                starved
            }
            Phase::Probing => {
                let probe_idle = self
                    .probe
                    .as_deref()
                    .and_then(|p| conns.iter().find(|(a, _)| *a == p))
                    .map_or(false, |(_, idle)| *idle);
                if !probe_idle {
                    return false;
                }
                let current = self.probe.take();
                let others: Vec<&str> = conns
                    .iter()
                    .map(|(a, _)| *a)
                    .filter(|a| Some(*a) != current.as_deref())
                    .collect();
                self.probe = others.choose(&mut rand::rng()).map(|a| a.to_string());
                true
            }
            Phase::Waiting => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{ExponentialStrategy, FullJitterStrategy};
    use proptest::prelude::*;

    fn strategy() -> ExponentialStrategy {
        ExponentialStrategy::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn test_even_split() {
        assert_eq!(compute_targets(10, 2, 0), vec![5, 5]);
        assert_eq!(compute_targets(10, 3, 0), vec![4, 3, 3]);
        assert_eq!(compute_targets(10, 3, 2), vec![4, 3, 4]);
        assert!(compute_targets(10, 0, 0).is_empty());
    }

    #[test]
    fn test_fewer_credits_than_connections() {
        assert_eq!(compute_targets(1, 2, 0), vec![1, 0]);
        assert_eq!(compute_targets(1, 2, 1), vec![0, 1]);
        assert_eq!(compute_targets(2, 5, 4), vec![1, 0, 0, 0, 1]);
    }

    proptest! {
        #[test]
        fn prop_targets_sum_to_budget(max in 0u32..10_000, conns in 1usize..50, cursor in 0usize..100) {
            let targets = compute_targets(max, conns, cursor);
            prop_assert_eq!(targets.len(), conns);
            prop_assert_eq!(targets.iter().map(|t| u64::from(*t)).sum::<u64>(), u64::from(max));
            let min = *targets.iter().min().unwrap();
            let hi = *targets.iter().max().unwrap();
            prop_assert!(hi - min <= 1);
        }

        #[test]
        fn prop_backoff_total_at_most_one(outcomes in proptest::collection::vec(any::<bool>(), 1..40), conns in 1usize..6) {
            let addrs: Vec<String> = (0..conns).map(|i| format!("10.0.0.{}:4150", i)).collect();
            let addrs: Vec<&str> = addrs.iter().map(|s| s.as_str()).collect();
            let mut flow = FlowState::new();
            for ok in outcomes {
                let outcome = if ok { Outcome::Success } else { Outcome::Failure };
                if let Action::Backoff { generation, .. } = flow.record(outcome, &strategy(), MAX) {
                    prop_assert_eq!(flow.targets(&addrs, 100).iter().sum::<u32>(), 0);
                    flow.backoff_elapsed(generation);
                }
                let total: u32 = flow.targets(&addrs, 100).iter().sum();
                match flow.phase() {
                    Phase::Normal => prop_assert_eq!(total, 100),
                    _ => prop_assert!(total <= 1),
                }
            }
        }
    }

    #[test]
    fn test_failure_enters_backoff() {
        let mut flow = FlowState::new();
        let action = flow.record(Outcome::Failure, &strategy(), MAX);
        assert_eq!(
            action,
            Action::Backoff {
                delay: Duration::from_secs(1),
                generation: 1
            }
        );
        assert_eq!(flow.phase(), Phase::Waiting);
        assert_eq!(flow.targets(&["a:1", "b:1"], 10), vec![0, 0]);
    }

    #[test]
    fn test_outcomes_ignored_while_waiting() {
        let mut flow = FlowState::new();
        flow.record(Outcome::Failure, &strategy(), MAX);
        assert_eq!(flow.record(Outcome::Failure, &strategy(), MAX), Action::None);
        assert_eq!(flow.record(Outcome::Success, &strategy(), MAX), Action::None);
        assert_eq!(flow.failures(), 1);
    }

    #[test]
    fn test_probe_then_recover() {
        let mut flow = FlowState::new();
        flow.record(Outcome::Failure, &strategy(), MAX);
        assert!(flow.backoff_elapsed(1));
        assert_eq!(flow.phase(), Phase::Probing);

        let targets = flow.targets(&["a:1", "b:1", "c:1"], 10);
        assert_eq!(targets.iter().sum::<u32>(), 1);
        // probe stays put
        assert_eq!(flow.targets(&["a:1", "b:1", "c:1"], 10), targets);

        assert_eq!(flow.record(Outcome::Success, &strategy(), MAX), Action::Redistribute);
        assert_eq!(flow.phase(), Phase::Normal);
        assert_eq!(flow.targets(&["a:1", "b:1"], 10), vec![5, 5]);
    }

    #[test]
    fn test_backoff_delays_never_shrink() {
        let mut flow = FlowState::new();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            match flow.record(Outcome::Failure, &strategy(), MAX) {
                Action::Backoff { delay, generation } => {
                    assert!(delay >= last);
                    assert!(delay <= MAX);
                    last = delay;
                    flow.backoff_elapsed(generation);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(last, MAX);
    }

    #[test]
    fn test_jittered_failures_stop_at_ceiling() {
        let max = Duration::from_secs(4);
        let jitter = FullJitterStrategy::new(Duration::from_secs(1), max);
        let mut flow = FlowState::new();
        for _ in 0..200 {
            match flow.record(Outcome::Failure, &jitter, max) {
                Action::Backoff { delay, generation } => {
                    assert!(delay <= max);
                    flow.backoff_elapsed(generation);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        // 1s, 2s, 4s: the third failure reaches the ceiling
        assert_eq!(flow.failures(), 3);

        let mut probes = 0;
        while flow.phase() != Phase::Normal {
            if let Action::Backoff { generation, .. } = flow.record(Outcome::Success, &jitter, max) {
                flow.backoff_elapsed(generation);
            }
            probes += 1;
        }
        assert_eq!(probes, 3);
    }

    #[test]
    fn test_success_decrements_by_one() {
        let mut flow = FlowState::new();
        for _ in 0..3 {
            if let Action::Backoff { generation, .. } = flow.record(Outcome::Failure, &strategy(), MAX) {
                flow.backoff_elapsed(generation);
            }
        }
        assert_eq!(flow.failures(), 3);

        match flow.record(Outcome::Success, &strategy(), MAX) {
            Action::Backoff { delay, .. } => assert_eq!(delay, Duration::from_secs(2)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(flow.failures(), 2);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let mut flow = FlowState::new();
        flow.record(Outcome::Failure, &strategy(), MAX);
        flow.backoff_elapsed(1);
        flow.record(Outcome::Failure, &strategy(), MAX);
        assert!(!flow.backoff_elapsed(1));
        assert!(flow.backoff_elapsed(2));
    }

    #[test]
    fn test_zero_max_backoff_disables() {
        let mut flow = FlowState::new();
        assert_eq!(flow.record(Outcome::Failure, &strategy(), Duration::ZERO), Action::None);
        assert_eq!(flow.phase(), Phase::Normal);
    }

    #[test]
    fn test_redistribute_rotates_idle_credit() {
        let mut flow = FlowState::new();
        let addrs = ["a:1", "b:1", "c:1"];
        assert_eq!(flow.targets(&addrs, 1), vec![1, 0, 0]);

        assert!(!flow.redistribute(&[("a:1", false), ("b:1", true), ("c:1", true)], 1));
        assert!(flow.redistribute(&[("a:1", true), ("b:1", true), ("c:1", true)], 1));
        assert_eq!(flow.targets(&addrs, 1), vec![0, 1, 0]);

        // enough credit for everyone: nothing to move
        assert!(!flow.redistribute(&[("a:1", true), ("b:1", true), ("c:1", true)], 3));
    }

    #[test]
    fn test_redistribute_moves_idle_probe() {
        let mut flow = FlowState::new();
        flow.record(Outcome::Failure, &strategy(), MAX);
        flow.backoff_elapsed(1);
        let addrs = ["a:1", "b:1"];
        let before = flow.targets(&addrs, 10);
        let probe = if before[0] == 1 { "a:1" } else { "b:1" };

        let idle: Vec<(&str, bool)> = addrs.iter().map(|a| (*a, *a == probe)).collect();
        assert!(flow.redistribute(&idle, 10));
        let after = flow.targets(&addrs, 10);
        assert_eq!(after.iter().sum::<u32>(), 1);
        assert_ne!(after, before);
    }
}
