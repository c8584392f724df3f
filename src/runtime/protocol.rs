//! Request/response rules for the echo exchange.
//!
//! There is no framing: each request is the same literal payload, and the
//! response is complete once exactly that many bytes have come back.

/// Bytes sent on every exchange.
pub const REQUEST_PAYLOAD: &[u8] = b"FOOBAR";

/// State of the bytes received so far for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoStatus {
    /// Prefix of the payload, more bytes expected.
    Incomplete,
    /// The full payload came back.
    Complete,
    /// The peer sent something other than our payload.
    Mismatch,
}

/// Classify the bytes accumulated for the current exchange.
pub fn check_echo(received: &[u8]) -> EchoStatus {
    if received.len() > REQUEST_PAYLOAD.len() {
        return EchoStatus::Mismatch;
    }
    if !REQUEST_PAYLOAD.starts_with(received) {
        return EchoStatus::Mismatch;
    }
    if received.len() == REQUEST_PAYLOAD.len() {
        EchoStatus::Complete
    } else {
        EchoStatus::Incomplete
    }
}

/// What a connection does after an exchange completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Issue the next request right away.
    SendNext,
    /// The quota is met, close the connection.
    Finish,
}

/// Decide the next step given the completed exchange count and the quota.
///
/// The quota is inclusive: a connection performs exactly `quota` exchanges.
pub fn after_exchange(completed: u64, quota: u64) -> NextStep {
    if completed < quota {
        NextStep::SendNext
    } else {
        NextStep::Finish
    }
}
