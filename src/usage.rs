//! Session accounting seam.
//!
//! The usage-limits store itself is an external collaborator; this module
//! only defines the interface the relay front-ends call around connection
//! acceptance, plus a no-op implementation used when accounting is not
//! wired up.

use tracing::debug;

/// Result of asking the accounting backend to admit a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingDecision {
    /// Session admitted; the ID must be passed back to `end_session`.
    Allowed(String),
    /// Session refused with a human-readable reason (quota exhausted,
    /// account expired, ...). The connection is closed before any protocol
    /// exchange completes.
    Denied(String),
}

/// Interface to the external usage-limits collaborator.
///
/// `user` is whatever identity the front-end has; under SOCKS5 NOAUTH and
/// plain CONNECT that is the peer IP string. `service` names the front-end
/// ("socks5", "connect", "wsbridge").
pub trait SessionAccounting: Send + Sync {
    fn begin_session(&self, user: &str, service: &str, ip: &str) -> AccountingDecision;
    fn end_session(&self, session_id: &str, bytes_in: u64, bytes_out: u64);
}

/// Accounting backend that admits everything and records nothing.
#[derive(Debug, Default)]
pub struct NoopAccounting;

impl SessionAccounting for NoopAccounting {
    fn begin_session(&self, user: &str, service: &str, _ip: &str) -> AccountingDecision {
        debug!(user = %user, service = %service, "Accounting disabled, session admitted");
        AccountingDecision::Allowed(String::new())
    }

    fn end_session(&self, _session_id: &str, _bytes_in: u64, _bytes_out: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_admits_everything() {
        let acct = NoopAccounting;
        match acct.begin_session("10.0.0.1", "socks5", "10.0.0.1") {
            AccountingDecision::Allowed(_) => {}
            AccountingDecision::Denied(reason) => panic!("noop denied: {}", reason),
        }
        acct.end_session("", 10, 20);
    }
}
