//! Session types.

use serde::{Deserialize, Serialize};

/// The authenticated identity of one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    #[serde(flatten)]
    pub user: UserInfo,
}

/// Server-side record of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// Credentials posted to the login endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Result of a login attempt.
///
/// A rejected login is a normal outcome, not an error: `status` carries the
/// server's answer and `user` stays `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub status: u16,
    pub user: Option<UserInfo>,
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.user.is_some()
    }
}

/// Storage field names for a persisted session.
pub mod fields {
    pub const TOKEN: &str = "token";
    pub const USERNAME: &str = "username";
    pub const EMAIL: &str = "email";
    pub const ROLE: &str = "role";

    pub const ALL: [&str; 4] = [TOKEN, USERNAME, EMAIL, ROLE];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_deserializes_flat_login_response() {
        let session: Session = serde_json::from_value(json!({
            "token": "abc",
            "username": "ops",
            "email": "ops@example.com",
            "role": "Administrator"
        }))
        .unwrap();
        assert_eq!(session.token, "abc");
        assert_eq!(session.user.role, "Administrator");
    }

    #[test]
    fn test_login_outcome_success_requires_user() {
        let rejected = LoginOutcome {
            status: 200,
            user: None,
        };
        assert!(!rejected.is_success());
        let denied = LoginOutcome {
            status: 403,
            user: None,
        };
        assert!(!denied.is_success());
    }
}
