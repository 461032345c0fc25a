//! Per-tick aggregation of slave builder completion.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tracing::{info, warn};

use conveyor_core::BuilderStatus;

/// How long a master waits for a slave to report anything at all before
/// concluding it never started.
pub const BUILDER_START_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Ephemeral state machine driven once per poll tick.
///
/// `previously_completed` only grows, so a builder's completion is reported
/// exactly once no matter how many ticks observe it.
#[derive(Debug)]
pub struct SlaveStatus {
    expected: BTreeSet<String>,
    status: HashMap<String, BuilderStatus>,
    previously_completed: BTreeSet<String>,
}

impl SlaveStatus {
    pub fn new(expected: impl IntoIterator<Item = String>) -> Self {
        SlaveStatus {
            expected: expected.into_iter().collect(),
            status: HashMap::new(),
            previously_completed: BTreeSet::new(),
        }
    }

    /// Fold in a freshly fetched status map.
    pub fn update(&mut self, status: HashMap<String, BuilderStatus>) {
        self.status = status;
        let completed: BTreeSet<String> = self
            .status
            .iter()
            .filter(|(name, s)| self.expected.contains(*name) && s.completed())
            .map(|(name, _)| name.clone())
            .collect();
        let newly: Vec<&String> = completed
            .difference(&self.previously_completed)
            .collect();
        if !newly.is_empty() {
            info!(builders = ?newly, "builders completed");
        }
        self.previously_completed.extend(completed);
    }

    /// Expected builders that have not reported any status.
    pub fn missing_builders(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|name| !self.status.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Expected builders observed in a terminal state so far.
    pub fn completed_builders(&self) -> Vec<String> {
        self.previously_completed.iter().cloned().collect()
    }

    pub fn all_completed(&self) -> bool {
        self.expected
            .iter()
            .all(|name| self.previously_completed.contains(name))
    }

    /// True when the poll has run longer than the start deadline and every
    /// expected builder that has not completed never reported at all.
    /// Distinguishes "slow" from "never started".
    pub fn should_fail_for_builder_start_timeout(&self, elapsed: Duration) -> bool {
        if elapsed <= BUILDER_START_TIMEOUT {
            return false;
        }
        let missing: BTreeSet<String> = self.missing_builders().into_iter().collect();
        self.expected
            .iter()
            .filter(|name| !self.previously_completed.contains(*name))
            .all(|name| missing.contains(name))
    }

    /// Whether the poll loop should keep waiting.
    pub fn should_wait(&self, elapsed: Duration) -> bool {
        if self.all_completed() {
            return false;
        }
        if self.should_fail_for_builder_start_timeout(elapsed) {
            warn!(
                missing = ?self.missing_builders(),
                "builders never started, giving up on them"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::BuildStatus;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn status_map(entries: &[(&str, BuildStatus)]) -> HashMap<String, BuilderStatus> {
        entries
            .iter()
            .map(|(name, s)| (name.to_string(), BuilderStatus::new(*s)))
            .collect()
    }

    const UNDER: Duration = Duration::from_secs(60);
    const OVER: Duration = Duration::from_secs(6 * 60);

    #[test]
    fn waits_while_builders_outstanding() {
        let mut slaves = SlaveStatus::new(names(&["a", "b"]));
        slaves.update(status_map(&[("a", BuildStatus::Passed)]));
        assert!(slaves.should_wait(UNDER));
        assert_eq!(slaves.missing_builders(), vec!["b"]);
    }

    #[test]
    fn stops_when_all_completed() {
        let mut slaves = SlaveStatus::new(names(&["a", "b"]));
        slaves.update(status_map(&[
            ("a", BuildStatus::Passed),
            ("b", BuildStatus::Failed),
        ]));
        assert!(slaves.all_completed());
        assert!(!slaves.should_wait(UNDER));
    }

    #[test]
    fn never_started_builder_times_out_after_deadline() {
        let mut slaves = SlaveStatus::new(names(&["a", "b"]));
        slaves.update(status_map(&[("a", BuildStatus::Passed)]));
        assert!(!slaves.should_fail_for_builder_start_timeout(UNDER));
        assert!(slaves.should_fail_for_builder_start_timeout(OVER));
        assert!(!slaves.should_wait(OVER));
    }

    #[test]
    fn inflight_builder_is_slow_not_missing() {
        let mut slaves = SlaveStatus::new(names(&["a", "b"]));
        slaves.update(status_map(&[
            ("a", BuildStatus::Passed),
            ("b", BuildStatus::Inflight),
        ]));
        // b reported in, so the start timeout never fires.
        assert!(!slaves.should_fail_for_builder_start_timeout(OVER));
        assert!(slaves.should_wait(OVER));
    }

    #[test]
    fn completion_survives_a_later_missing_tick() {
        let mut slaves = SlaveStatus::new(names(&["a", "b"]));
        slaves.update(status_map(&[("a", BuildStatus::Passed)]));
        // Next tick the store read misses a's blob; completion is monotone.
        slaves.update(status_map(&[("b", BuildStatus::Passed)]));
        assert!(slaves.all_completed());
    }

    #[test]
    fn unexpected_builders_are_ignored() {
        let mut slaves = SlaveStatus::new(names(&["a"]));
        slaves.update(status_map(&[
            ("a", BuildStatus::Inflight),
            ("stranger", BuildStatus::Passed),
        ]));
        assert!(slaves.completed_builders().is_empty());
        assert!(slaves.should_wait(UNDER));
    }
}
