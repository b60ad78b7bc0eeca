//! OpenSSH-style known-hosts lookups for the SSH transport's trust
//! decisions.

use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq)]
pub enum KnownHostValidationResult {
    Valid,
    /// We know a key for this host and it is a different one.
    Invalid {
        key_type: String,
        key_base64: String,
    },
    Unknown,
}

pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn validate(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_base64: &str,
    ) -> std::io::Result<KnownHostValidationResult> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(KnownHostValidationResult::Unknown)
            }
            Err(e) => return Err(e),
        };

        let bracketed = format!("[{host}]:{port}");
        let mut mismatch = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(patterns), Some(line_type), Some(line_base64)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            let host_matches = patterns
                .split(',')
                .any(|p| p == host || p == bracketed);
            if !host_matches || line_type != key_type {
                continue;
            }

            if line_base64 == key_base64 {
                return Ok(KnownHostValidationResult::Valid);
            }
            mismatch.get_or_insert_with(|| KnownHostValidationResult::Invalid {
                key_type: line_type.to_owned(),
                key_base64: line_base64.to_owned(),
            });
        }

        Ok(mismatch.unwrap_or(KnownHostValidationResult::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture(contents: &str) -> (KnownHosts, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "hatchway-known-hosts-{}-{}",
            std::process::id(),
            contents.len()
        ));
        tokio::fs::write(&path, contents).await.unwrap();
        (KnownHosts::new(&path), path)
    }

    #[tokio::test]
    async fn test_validate_known_key() {
        let (hosts, path) =
            fixture("# comment\nexample.com ssh-ed25519 AAAAkey1\nother.com ssh-ed25519 AAAAkey2\n")
                .await;

        assert_eq!(
            hosts
                .validate("example.com", 22, "ssh-ed25519", "AAAAkey1")
                .await
                .unwrap(),
            KnownHostValidationResult::Valid
        );
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_validate_mismatched_key() {
        let (hosts, path) = fixture("example.com ssh-ed25519 AAAAright\n").await;

        assert_eq!(
            hosts
                .validate("example.com", 22, "ssh-ed25519", "AAAAwrong")
                .await
                .unwrap(),
            KnownHostValidationResult::Invalid {
                key_type: "ssh-ed25519".into(),
                key_base64: "AAAAright".into(),
            }
        );
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_validate_unknown_host_and_missing_file() {
        let (hosts, path) = fixture("example.com ssh-ed25519 AAAAkey\n").await;
        assert_eq!(
            hosts
                .validate("elsewhere.com", 22, "ssh-ed25519", "AAAAkey")
                .await
                .unwrap(),
            KnownHostValidationResult::Unknown
        );
        let _ = std::fs::remove_file(&path);

        let missing = KnownHosts::new("/definitely/not/a/known_hosts");
        assert_eq!(
            missing
                .validate("example.com", 22, "ssh-ed25519", "AAAAkey")
                .await
                .unwrap(),
            KnownHostValidationResult::Unknown
        );
    }

    #[tokio::test]
    async fn test_validate_bracketed_port_pattern() {
        let (hosts, path) = fixture("[example.com]:2222 ssh-ed25519 AAAAkey\n").await;
        assert_eq!(
            hosts
                .validate("example.com", 2222, "ssh-ed25519", "AAAAkey")
                .await
                .unwrap(),
            KnownHostValidationResult::Valid
        );
        assert_eq!(
            hosts
                .validate("example.com", 22, "ssh-ed25519", "AAAAkey")
                .await
                .unwrap(),
            KnownHostValidationResult::Unknown
        );
        let _ = std::fs::remove_file(path);
    }
}
