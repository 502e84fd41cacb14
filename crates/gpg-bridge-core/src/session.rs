//! Passcode generation and per-connection authentication state.

use std::fmt;

/// Number of decimal digits in a passcode.
pub const PASSCODE_DIGITS: usize = 6;

const PASSCODE_SPACE: u32 = 1_000_000;
// Largest multiple of PASSCODE_SPACE that fits in a u32; draws at or above it
// are rejected so every code is equally likely.
const REJECTION_BOUND: u32 = u32::MAX - (u32::MAX % PASSCODE_SPACE);

/// The process-wide passcode shown to the local operator.
#[derive(Clone, PartialEq, Eq)]
pub struct Passcode(String);

impl Passcode {
    /// Generate a fresh 6-digit passcode from the OS CSPRNG.
    pub fn generate() -> Result<Self, getrandom::Error> {
        loop {
            let mut buf = [0u8; 4];
            getrandom::fill(&mut buf)?;
            let draw = u32::from_le_bytes(buf);
            if draw < REJECTION_BOUND {
                return Ok(Self(format!(
                    "{:0width$}",
                    draw % PASSCODE_SPACE,
                    width = PASSCODE_DIGITS
                )));
            }
        }
    }

    /// The digits, for display to the operator.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Exact comparison of a client-submitted value, in constant time.
    pub fn matches(&self, submitted: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), submitted.as_bytes())
    }
}

impl From<&str> for Passcode {
    fn from(code: &str) -> Self {
        Self(code.to_owned())
    }
}

// Keep the code out of Debug output so it never reaches a log line by accident.
impl fmt::Debug for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passcode(******)")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Result of a passcode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The session just moved to authenticated.
    Granted,
    /// Wrong value; the session stays unauthenticated.
    Rejected,
    /// The session was already authenticated; nothing changed.
    AlreadyAuthenticated,
}

/// Per-connection state. Starts unauthenticated; the only transition is to
/// authenticated, and it is permanent for the connection's lifetime.
#[derive(Debug, Default)]
pub struct Session {
    authenticated: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn authenticate(&mut self, submitted: &str, passcode: &Passcode) -> AuthOutcome {
        if self.authenticated {
            return AuthOutcome::AlreadyAuthenticated;
        }
        if passcode.matches(submitted) {
            self.authenticated = true;
            AuthOutcome::Granted
        } else {
            AuthOutcome::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passcode_is_six_digits() {
        for _ in 0..64 {
            let code = Passcode::generate().unwrap();
            assert_eq!(code.expose().len(), PASSCODE_DIGITS);
            assert!(code.expose().chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn debug_hides_digits() {
        let code = Passcode::from("123456");
        assert!(!format!("{code:?}").contains("123456"));
    }

    #[test]
    fn comparison_is_exact() {
        let code = Passcode::from("012345");
        assert!(code.matches("012345"));
        assert!(!code.matches("12345"));
        assert!(!code.matches("012345 "));
        assert!(!code.matches(" 012345"));
        assert!(!code.matches("0123456"));
        assert!(!code.matches(""));
    }

    #[test]
    fn session_starts_unauthenticated() {
        assert!(!Session::new().is_authenticated());
    }

    #[test]
    fn wrong_passcode_keeps_session_locked() {
        let code = Passcode::from("111111");
        let mut session = Session::new();
        assert_eq!(session.authenticate("222222", &code), AuthOutcome::Rejected);
        assert!(!session.is_authenticated());
        assert_eq!(session.authenticate("111111", &code), AuthOutcome::Granted);
        assert!(session.is_authenticated());
    }

    #[test]
    fn authentication_is_permanent() {
        let code = Passcode::from("111111");
        let mut session = Session::new();
        assert_eq!(session.authenticate("111111", &code), AuthOutcome::Granted);
        assert_eq!(
            session.authenticate("999999", &code),
            AuthOutcome::AlreadyAuthenticated
        );
        assert!(session.is_authenticated());
        assert_eq!(
            session.authenticate("111111", &code),
            AuthOutcome::AlreadyAuthenticated
        );
    }
}
