use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a channel or session ended, as reported in a `close` control command.
/// A clean close carries no problem at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Problem {
    ProtocolError,
    InternalError,
    Terminated,
    Timeout,
    NoSession,
    NotAuthenticated,
    UnknownHostkey,
    AuthenticationFailed,
    PermissionDenied,
    NotFound,
}

impl Problem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Problem::ProtocolError => "protocol-error",
            Problem::InternalError => "internal-error",
            Problem::Terminated => "terminated",
            Problem::Timeout => "timeout",
            Problem::NoSession => "no-session",
            Problem::NotAuthenticated => "not-authenticated",
            Problem::UnknownHostkey => "unknown-hostkey",
            Problem::AuthenticationFailed => "authentication-failed",
            Problem::PermissionDenied => "permission-denied",
            Problem::NotFound => "not-found",
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Problem {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "protocol-error" => Problem::ProtocolError,
            "internal-error" => Problem::InternalError,
            "terminated" => Problem::Terminated,
            "timeout" => Problem::Timeout,
            "no-session" => Problem::NoSession,
            "not-authenticated" => Problem::NotAuthenticated,
            "unknown-hostkey" => Problem::UnknownHostkey,
            "authentication-failed" => Problem::AuthenticationFailed,
            "permission-denied" => Problem::PermissionDenied,
            "not-found" => Problem::NotFound,
            _ => return Err(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tokens() {
        assert_eq!(Problem::UnknownHostkey.to_string(), "unknown-hostkey");
        assert_eq!(
            serde_json::to_value(Problem::ProtocolError).unwrap(),
            serde_json::json!("protocol-error")
        );
        assert_eq!("timeout".parse::<Problem>(), Ok(Problem::Timeout));
        assert!("no-such-problem".parse::<Problem>().is_err());
    }
}
