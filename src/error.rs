// src/error.rs

use serde::Serialize;
use std::fmt;

/// Error classification shared by every module
///
/// Transport layers map this onto their own status codes; the variants are
/// deliberately coarse so that authentication failures disclose nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, recoverable by correcting it
    Validation,

    /// Identity does not exist
    NotFound,

    /// Operation invalid in the current state
    Conflict,

    /// Hypervisor binary missing or not executable
    ExecutableInvalid,

    /// Launch, shutdown or wait failed at the process boundary
    ExternalProcess,

    /// Unknown user or wrong password
    InvalidCredentials,

    /// Bad signature, algorithm or validity window
    InvalidToken,

    /// Admission refused by the rate limiter
    RateLimited,

    /// Authenticated but lacking the required role
    Forbidden,

    /// Persistence or unexpected failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ExecutableInvalid => "executable_invalid",
            ErrorKind::ExternalProcess => "external_process",
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::InvalidToken => "invalid_token",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}
