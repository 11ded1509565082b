//! Which error a socket condition should produce.
//!
//! Scenarios never match on platform error codes. They describe the
//! condition they provoked, ask [`expected_kind`] what the endpoint's
//! [`BlockingMode`] turns it into, and check the observed [`Error`] against
//! that through an [`ExpectedOutcome`].

use crate::error::{Error, ErrorKind};
use crate::payload::Payload;
use crate::transport::BlockingMode;

/// A condition a scenario provokes on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The operation cannot make progress until the peer does something.
    WouldNeedToBlock,
    /// The operation's deadline passed before it completed.
    DeadlineExceeded,
    /// The peer closed or reset the connection before the handshake finished.
    PeerClosedDuringHandshake,
}

/// The error kind `condition` produces under `mode`, or `None` when the
/// operation simply suspends.
pub fn expected_kind(mode: BlockingMode, condition: Condition) -> Option<ErrorKind> {
    match (mode, condition) {
        (_, Condition::PeerClosedDuringHandshake) => Some(ErrorKind::Handshake),
        (BlockingMode::NonBlocking, _) => Some(ErrorKind::WouldBlock),
        (BlockingMode::Timeout(_), _) => Some(ErrorKind::Timeout),
        (BlockingMode::Blocking, Condition::WouldNeedToBlock) => None,
        // A blocking operation has no deadline to exceed.
        (BlockingMode::Blocking, Condition::DeadlineExceeded) => None,
    }
}

/// What a scenario step is expected to end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutcome {
    WouldBlockError,
    TimeoutError,
    HandshakeError,
    /// The peer closed with close_notify.
    CleanEof,
    /// The received bytes equal the payload.
    ExactByteMatch,
}

impl ExpectedOutcome {
    /// The error outcome for `condition` under `mode`. `None` when the
    /// condition is not an error in that mode.
    pub fn for_condition(mode: BlockingMode, condition: Condition) -> Option<Self> {
        expected_kind(mode, condition).and_then(|kind| match kind {
            ErrorKind::WouldBlock => Some(ExpectedOutcome::WouldBlockError),
            ErrorKind::Timeout => Some(ExpectedOutcome::TimeoutError),
            ErrorKind::Handshake => Some(ExpectedOutcome::HandshakeError),
            _ => None,
        })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExpectedOutcome::WouldBlockError => Some(ErrorKind::WouldBlock),
            ExpectedOutcome::TimeoutError => Some(ErrorKind::Timeout),
            ExpectedOutcome::HandshakeError => Some(ErrorKind::Handshake),
            ExpectedOutcome::CleanEof | ExpectedOutcome::ExactByteMatch => None,
        }
    }

    /// Checks that `err` is the expected error.
    pub fn check_error(&self, scenario: &'static str, err: &Error) -> Result<(), Error> {
        match self.error_kind() {
            Some(kind) if err.kind() == kind => Ok(()),
            Some(kind) => Err(Error::ScenarioFailed {
                scenario,
                reason: format!("expected {kind:?}, got {:?}: {err}", err.kind()),
            }),
            None => Err(Error::ScenarioFailed {
                scenario,
                reason: format!("expected {self:?}, got error: {err}"),
            }),
        }
    }

    /// Checks an operation's result, which must be the expected error.
    pub fn check_result<T>(&self, scenario: &'static str, result: &Result<T, Error>) -> Result<(), Error> {
        match result {
            Err(err) => self.check_error(scenario, err),
            Ok(_) => Err(Error::ScenarioFailed {
                scenario,
                reason: format!("expected {self:?}, but the operation succeeded"),
            }),
        }
    }

    pub fn check_eof(&self, scenario: &'static str, clean: bool) -> Result<(), Error> {
        match self {
            ExpectedOutcome::CleanEof if clean => Ok(()),
            ExpectedOutcome::CleanEof => Err(Error::ScenarioFailed {
                scenario,
                reason: "peer closed without close_notify".to_string(),
            }),
            other => Err(Error::ScenarioFailed {
                scenario,
                reason: format!("expected {other:?}, got end of stream"),
            }),
        }
    }

    /// Checks received bytes against `expected`: an exact match for
    /// [`ExactByteMatch`](Self::ExactByteMatch), a prefix otherwise.
    pub fn check_bytes(
        &self,
        scenario: &'static str,
        expected: &Payload,
        actual: &[u8],
    ) -> Result<(), Error> {
        if let Some(offset) = expected.first_mismatch(actual) {
            return Err(Error::ScenarioFailed {
                scenario,
                reason: format!(
                    "received bytes diverge from the payload at offset {offset} ({} of {} bytes received)",
                    actual.len(),
                    expected.len()
                ),
            });
        }
        if *self == ExpectedOutcome::ExactByteMatch && actual.len() != expected.len() {
            return Err(Error::ScenarioFailed {
                scenario,
                reason: format!(
                    "received {} of {} bytes",
                    actual.len(),
                    expected.len()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TIMED: BlockingMode = BlockingMode::Timeout(Duration::from_millis(100));

    #[test]
    fn mapping_table() {
        use Condition::*;

        assert_eq!(
            expected_kind(BlockingMode::NonBlocking, WouldNeedToBlock),
            Some(ErrorKind::WouldBlock)
        );
        assert_eq!(expected_kind(TIMED, WouldNeedToBlock), Some(ErrorKind::Timeout));
        assert_eq!(expected_kind(TIMED, DeadlineExceeded), Some(ErrorKind::Timeout));
        assert_eq!(expected_kind(BlockingMode::Blocking, WouldNeedToBlock), None);

        for mode in [BlockingMode::Blocking, BlockingMode::NonBlocking, TIMED] {
            assert_eq!(
                expected_kind(mode, PeerClosedDuringHandshake),
                Some(ErrorKind::Handshake)
            );
        }
    }

    #[test]
    fn outcome_for_condition() {
        assert_eq!(
            ExpectedOutcome::for_condition(BlockingMode::NonBlocking, Condition::WouldNeedToBlock),
            Some(ExpectedOutcome::WouldBlockError)
        );
        assert_eq!(
            ExpectedOutcome::for_condition(TIMED, Condition::DeadlineExceeded),
            Some(ExpectedOutcome::TimeoutError)
        );
        assert_eq!(
            ExpectedOutcome::for_condition(BlockingMode::Blocking, Condition::WouldNeedToBlock),
            None
        );
    }

    #[test]
    fn check_error_compares_kinds() {
        let would_block = Error::WouldBlock { operation: "send" };
        let timeout = Error::timeout("send", Duration::from_millis(100));

        assert!(ExpectedOutcome::WouldBlockError
            .check_error("test", &would_block)
            .is_ok());
        let err = ExpectedOutcome::WouldBlockError
            .check_error("test", &timeout)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Scenario);
        assert!(ExpectedOutcome::CleanEof
            .check_error("test", &timeout)
            .is_err());

        let ok: Result<(), Error> = Ok(());
        assert!(ExpectedOutcome::TimeoutError.check_result("test", &ok).is_err());
    }

    #[test]
    fn check_bytes_prefix_and_exact() {
        let payload = Payload::with_head(b"GET ", b"ab", 4);
        let full = payload.to_vec();

        assert!(ExpectedOutcome::ExactByteMatch
            .check_bytes("test", &payload, &full)
            .is_ok());
        assert!(ExpectedOutcome::ExactByteMatch
            .check_bytes("test", &payload, &full[..5])
            .is_err());
        assert!(ExpectedOutcome::TimeoutError
            .check_bytes("test", &payload, &full[..5])
            .is_ok());
        assert!(ExpectedOutcome::TimeoutError
            .check_bytes("test", &payload, b"GET x")
            .is_err());
    }

    #[test]
    fn check_eof() {
        assert!(ExpectedOutcome::CleanEof.check_eof("test", true).is_ok());
        assert!(ExpectedOutcome::CleanEof.check_eof("test", false).is_err());
        assert!(ExpectedOutcome::ExactByteMatch.check_eof("test", true).is_err());
    }
}
