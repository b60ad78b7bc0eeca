use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn _default_listen() -> String {
    "0.0.0.0:9090".to_owned()
}

fn _default_certificate_directory() -> String {
    "/etc/hatchway/ws-certs.d".to_owned()
}

fn _default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

fn _default_bridge_program() -> Vec<String> {
    vec!["hatchway".to_owned(), "bridge".to_owned()]
}

fn _default_ssh_port() -> u16 {
    22
}

fn _default_agent_program() -> String {
    "hatchway bridge".to_owned()
}

fn _default_known_hosts() -> String {
    "/var/lib/hatchway/known_hosts".to_owned()
}

fn _default_auth_idle_timeout() -> Duration {
    Duration::from_secs(900)
}

fn _default_session_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn _default_stream_batch_delay() -> Duration {
    Duration::from_millis(75)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "_default_listen")]
    pub listen: String,

    #[serde(default = "_default_certificate_directory")]
    pub certificate_directory: String,

    #[serde(default = "_default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: _default_listen(),
            certificate_directory: _default_certificate_directory(),
            ping_interval: _default_ping_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    /// Argv of the local bridge helper spawned for `localhost` sessions.
    #[serde(default = "_default_bridge_program")]
    pub program: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: _default_bridge_program(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SshConfig {
    #[serde(default = "_default_ssh_port")]
    pub port: u16,

    /// Command executed on the remote host to start the agent.
    #[serde(default = "_default_agent_program")]
    pub agent_program: String,

    #[serde(default = "_default_known_hosts")]
    pub known_hosts: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: _default_ssh_port(),
            agent_program: _default_agent_program(),
            known_hosts: _default_known_hosts(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    /// Logged-in credentials not refreshed by a live connection are
    /// forgotten after this long.
    #[serde(default = "_default_auth_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            idle_timeout: _default_auth_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CertificateConfig {
    /// Argv of an external self-signing helper. Empty means generate
    /// in-process.
    #[serde(default)]
    pub helper: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HatchwayConfigStore {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub certificate: CertificateConfig,

    #[serde(default = "_default_session_idle_timeout", with = "humantime_serde")]
    pub session_idle_timeout: Duration,

    #[serde(default = "_default_stream_batch_delay", with = "humantime_serde")]
    pub stream_batch_delay: Duration,
}

impl Default for HatchwayConfigStore {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            bridge: BridgeConfig::default(),
            ssh: SshConfig::default(),
            auth: AuthConfig::default(),
            certificate: CertificateConfig::default(),
            session_idle_timeout: _default_session_idle_timeout(),
            stream_batch_delay: _default_stream_batch_delay(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HatchwayConfig {
    pub store: HatchwayConfigStore,
    pub paths_relative_to: PathBuf,
}
