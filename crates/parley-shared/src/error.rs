use thiserror::Error;

/// Reasons a session token is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Structurally unparseable, or the signature does not verify.
    #[error("Malformed session token")]
    Malformed,

    #[error("Session token expired")]
    Expired,

    /// Authentic token whose claims are unacceptable.
    #[error("Invalid session token")]
    Invalid,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Username is empty")]
    Empty,

    #[error("Username too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Username contains whitespace or control characters")]
    InvalidCharacters,
}
