//! Listener-side test-run record: one per device and sub-protocol.

use serde::{Deserialize, Serialize};

use crate::messages::{MsgType, Protocol};
use crate::types::Guid;

use super::{TestId, TestOutcome};

/// Durable conformance test run for one device under one sub-protocol.
///
/// Drives a state machine parallel to the protocol's: an ordered queue of
/// tests, a queue cursor, the message type expected next, the set of
/// message types whose testing is finished, and the accumulated outcome
/// log. A fault test is popped when its step executes and credited as
/// passed only when the peer comes back and continues the protocol
/// correctly, so the queue cursor can run one ahead of the log.
///
/// The record is never deleted automatically; completed runs stay in the
/// store as the audit trail until an external administrative purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTestState {
    guid: Guid,
    protocol: Protocol,
    queue: Vec<TestId>,
    current_index: usize,
    last_test_id: TestId,
    expected_cmd: MsgType,
    completed_cmds: Vec<MsgType>,
    completed: bool,
    log: Vec<TestOutcome>,
}

impl ListenerTestState {
    /// Creates a run with a scripted `queue`, expecting `first_cmd` as the
    /// opening message.
    #[must_use]
    pub fn new(guid: Guid, protocol: Protocol, queue: Vec<TestId>, first_cmd: MsgType) -> Self {
        Self {
            guid,
            protocol,
            queue,
            current_index: 0,
            last_test_id: TestId::Null,
            expected_cmd: first_cmd,
            completed_cmds: Vec::new(),
            completed: false,
            log: Vec::new(),
        }
    }

    /// Device this run grades.
    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Sub-protocol this run covers.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Message type the peer is expected to send next.
    #[must_use]
    pub fn expected_cmd(&self) -> MsgType {
        self.expected_cmd
    }

    /// Whether the whole run has finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Recorded outcomes, oldest first.
    #[must_use]
    pub fn log(&self) -> &[TestOutcome] {
        &self.log
    }

    /// Most recently selected test.
    #[must_use]
    pub fn last_test_id(&self) -> TestId {
        self.last_test_id
    }

    /// Whether `observed` matches the expected next message type.
    #[must_use]
    pub fn check_expected_cmd(&self, observed: MsgType) -> bool {
        self.expected_cmd == observed
    }

    /// Whether testing for `cmd` is finished, either individually or
    /// because the whole run completed.
    #[must_use]
    pub fn check_cmd_testing_completed(&self, cmd: MsgType) -> bool {
        self.completed || self.completed_cmds.contains(&cmd)
    }

    /// Whether a previously selected test still awaits its outcome.
    ///
    /// True after a fault was injected and before the peer's next message
    /// settles whether it survived.
    #[must_use]
    pub fn has_pending_outcome(&self) -> bool {
        self.current_index > self.log.len()
    }

    /// Pops the next test from the queue, or [`TestId::Null`] when the run
    /// is complete or exhausted.
    pub fn get_next_test_id(&mut self) -> TestId {
        if self.completed || self.current_index >= self.queue.len() {
            self.last_test_id = TestId::Null;
            return TestId::Null;
        }
        let test_id = self.queue[self.current_index];
        self.current_index += 1;
        self.last_test_id = test_id;
        test_id
    }

    /// Records a pass for the most recently selected test.
    pub fn push_success(&mut self) {
        self.log.push(TestOutcome {
            test_id: self.last_test_id,
            passed: true,
            detail: None,
        });
    }

    /// Records a failure for the most recently selected test.
    pub fn push_fail(&mut self, reason: impl Into<String>) {
        self.log.push(TestOutcome {
            test_id: self.last_test_id,
            passed: false,
            detail: Some(reason.into()),
        });
    }

    /// Marks the current expected message type's testing finished and
    /// advances the expectation to `next`, mirroring the protocol's
    /// legal-transition table.
    pub fn complete_cmd_and_set_next(&mut self, next: MsgType) {
        if !self.completed_cmds.contains(&self.expected_cmd) {
            self.completed_cmds.push(self.expected_cmd);
        }
        self.expected_cmd = next;
    }

    /// Finishes the whole run. Subsequent steps pass through untested.
    pub fn complete_run(&mut self) {
        if !self.completed_cmds.contains(&self.expected_cmd) {
            self.completed_cmds.push(self.expected_cmd);
        }
        self.completed = true;
    }

    /// Number of recorded passes.
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.log.iter().filter(|outcome| outcome.passed).count()
    }

    /// Number of recorded failures.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.log.len() - self.passed_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(queue: Vec<TestId>) -> ListenerTestState {
        ListenerTestState::new(
            Guid::random(),
            Protocol::To1,
            queue,
            MsgType::To1HelloRv,
        )
    }

    #[test]
    fn pops_in_order_then_null() {
        let mut run = run_with(vec![
            TestId::BadEncoding(MsgType::To1HelloRv),
            TestId::Positive,
        ]);
        assert_eq!(
            run.get_next_test_id(),
            TestId::BadEncoding(MsgType::To1HelloRv)
        );
        assert_eq!(run.get_next_test_id(), TestId::Positive);
        assert_eq!(run.get_next_test_id(), TestId::Null);
        assert_eq!(run.last_test_id(), TestId::Null);
    }

    #[test]
    fn completed_run_is_pass_through() {
        let mut run = run_with(vec![TestId::Positive, TestId::Positive]);
        run.complete_run();
        assert_eq!(run.get_next_test_id(), TestId::Null);
        assert!(run.check_cmd_testing_completed(MsgType::To1HelloRv));
        assert!(run.check_cmd_testing_completed(MsgType::To1ProveToRv));
    }

    #[test]
    fn pending_outcome_tracks_uncredited_fault() {
        let mut run = run_with(vec![
            TestId::BadEncoding(MsgType::To1HelloRv),
            TestId::Positive,
        ]);
        assert!(!run.has_pending_outcome());
        let fault = run.get_next_test_id();
        assert!(fault.is_fault());
        // Fault injected, peer not heard from yet.
        assert!(run.has_pending_outcome());
        run.push_success();
        assert!(!run.has_pending_outcome());
        assert_eq!(run.passed_count(), 1);
    }

    #[test]
    fn expectation_advances_per_transition_table() {
        let mut run = run_with(vec![TestId::Positive]);
        assert!(run.check_expected_cmd(MsgType::To1HelloRv));
        assert!(!run.check_expected_cmd(MsgType::To1ProveToRv));

        run.complete_cmd_and_set_next(MsgType::To1ProveToRv);
        assert!(run.check_cmd_testing_completed(MsgType::To1HelloRv));
        assert!(!run.check_cmd_testing_completed(MsgType::To1ProveToRv));
        assert!(run.check_expected_cmd(MsgType::To1ProveToRv));
    }

    #[test]
    fn failures_accumulate_in_log() {
        let mut run = run_with(vec![TestId::Positive]);
        run.get_next_test_id();
        run.push_fail("expected 30, got 32");
        assert_eq!(run.failed_count(), 1);
        assert_eq!(run.log()[0].test_id, TestId::Positive);
        assert_eq!(run.log()[0].detail.as_deref(), Some("expected 30, got 32"));
    }
}
