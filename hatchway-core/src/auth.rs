//! The cookie login service. A successful login parks credentials under
//! an opaque cookie; gateway connections look them up on each socket
//! open. Entries idle out when nothing refreshes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hatchway_common::Credentials;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct Auth {
    idle_timeout: Duration,
    services: HashMap<String, AuthService>,
}

struct AuthService {
    creds: Arc<Credentials>,
    last_used: Instant,
}

impl Auth {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            services: HashMap::new(),
        }
    }

    /// Park freshly authenticated credentials; returns the cookie value.
    pub fn attach(&mut self, creds: Credentials) -> (String, Arc<Credentials>) {
        let cookie: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();
        let creds = Arc::new(creds);
        info!(user = %creds.user(), "logged in");
        self.services.insert(
            cookie.clone(),
            AuthService {
                creds: creds.clone(),
                last_used: Instant::now(),
            },
        );
        (cookie, creds)
    }

    /// Look up a cookie, refreshing its idle deadline. A stale entry is
    /// dropped on sight.
    pub fn check_cookie(&mut self, cookie: &str) -> Option<Arc<Credentials>> {
        let now = Instant::now();
        let service = self.services.get_mut(cookie)?;
        if now.duration_since(service.last_used) > self.idle_timeout {
            debug!("dropping idle login");
            self.services.remove(cookie);
            return None;
        }
        service.last_used = now;
        Some(service.creds.clone())
    }

    pub fn logout(&mut self, cookie: &str) -> bool {
        self.services.remove(cookie).is_some()
    }

    /// Drop every entry whose idle deadline has passed.
    pub fn vacuum(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        self.services
            .retain(|_, service| now.duration_since(service.last_used) <= idle_timeout);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(user: &str) -> Credentials {
        Credentials::new(user, None, Some("10.0.0.9".into()), "hatchway")
    }

    #[tokio::test(start_paused = true)]
    async fn test_cookie_roundtrip() {
        let mut auth = Auth::new(Duration::from_secs(1));
        let (cookie, original) = auth.attach(creds("admin"));

        let found = auth.check_cookie(&cookie).unwrap();
        assert_eq!(found.user(), original.user());
        assert!(auth.check_cookie("bogus").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_login_expires() {
        let mut auth = Auth::new(Duration::from_secs(1));
        let (cookie, _) = auth.attach(creds("admin"));
        assert!(auth.check_cookie(&cookie).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(auth.check_cookie(&cookie).is_none());
        assert!(auth.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_refreshes_deadline() {
        let mut auth = Auth::new(Duration::from_secs(2));
        let (cookie, _) = auth.attach(creds("admin"));

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(auth.check_cookie(&cookie).is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_vacuum_reaps_idle_entries() {
        let mut auth = Auth::new(Duration::from_secs(1));
        let (stale, _) = auth.attach(creds("admin"));
        tokio::time::advance(Duration::from_secs(2)).await;
        let (fresh, _) = auth.attach(creds("operator"));

        auth.vacuum();
        assert_eq!(auth.len(), 1);
        assert!(auth.check_cookie(&stale).is_none());
        assert!(auth.check_cookie(&fresh).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout() {
        let mut auth = Auth::new(Duration::from_secs(10));
        let (cookie, _) = auth.attach(creds("admin"));
        assert!(auth.logout(&cookie));
        assert!(!auth.logout(&cookie));
        assert!(auth.check_cookie(&cookie).is_none());
    }
}
