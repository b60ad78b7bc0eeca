use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroize;

use crate::Secret;

/// Credentials belonging to one authenticated browser, shared by every
/// channel and transport of its sessions. The password only ever lives in
/// memory and is scrubbed when the last holder drops the record.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    user: String,
    password: Option<Secret<String>>,
    rhost: Option<String>,
    csrf_token: String,
    application: String,
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        password: Option<Secret<String>>,
        rhost: Option<String>,
        application: impl Into<String>,
    ) -> Self {
        let csrf_token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();
        Self {
            user: user.into(),
            password,
            rhost,
            csrf_token,
            application: application.into(),
        }
    }

    /// New credentials for a secondary host, inheriting the remote peer
    /// address of the already authenticated browser.
    pub fn for_user(&self, user: &str, password: Option<Secret<String>>) -> Self {
        Self::new(user, password, self.rhost.clone(), self.application.clone())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> Option<&Secret<String>> {
        self.password.as_ref()
    }

    pub fn rhost(&self) -> Option<&str> {
        self.rhost.as_deref()
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn application(&self) -> &str {
        &self.application
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        if let Some(password) = self.password.as_mut() {
            password.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csrf_tokens_are_unique() {
        let a = Credentials::new("admin", None, None, "hatchway");
        let b = Credentials::new("admin", None, None, "hatchway");
        assert_ne!(a.csrf_token(), b.csrf_token());
        assert_eq!(a.csrf_token().len(), 64);
    }

    #[test]
    fn test_for_user_inherits_rhost() {
        let base = Credentials::new("admin", None, Some("10.0.0.9".into()), "hatchway");
        let other = base.for_user("operator", None);
        assert_eq!(other.user(), "operator");
        assert_eq!(other.rhost(), Some("10.0.0.9"));
    }
}
