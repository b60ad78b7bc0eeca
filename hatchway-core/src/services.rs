use std::sync::Arc;
use std::time::Duration;

use hatchway_common::HatchwayConfig;
use tokio::sync::Mutex;

use crate::auth::Auth;

/// Shared state every gateway connection hangs off of.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Mutex<HatchwayConfig>>,
    pub auth: Arc<Mutex<Auth>>,
}

impl Services {
    pub fn new(config: HatchwayConfig) -> Self {
        let auth = Arc::new(Mutex::new(Auth::new(config.store.auth.idle_timeout)));

        tokio::spawn({
            let auth = auth.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    auth.lock().await.vacuum();
                }
            }
        });

        Self {
            config: Arc::new(Mutex::new(config)),
            auth,
        }
    }
}
