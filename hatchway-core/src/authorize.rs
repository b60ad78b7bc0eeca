//! Bridge-originated `authorize` challenges. The bridge asks the gateway
//! to prove the user's credentials mid-session; the gateway answers from
//! the cached password without the browser ever seeing secrets.

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use hatchway_common::Credentials;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Debug, PartialEq)]
pub struct Challenge {
    pub challenge_type: String,
    pub user: String,
    pub nonce: String,
    pub salt: String,
}

/// Challenges look like `<type>:<hex(user)>:<nonce>:<salt>`.
pub fn parse_challenge(challenge: &str) -> Option<Challenge> {
    let mut fields = challenge.splitn(4, ':');
    let challenge_type = fields.next()?;
    let user_hex = fields.next()?;
    let nonce = fields.next()?;
    let salt = fields.next()?;
    if challenge_type.is_empty() || nonce.is_empty() || salt.is_empty() {
        return None;
    }

    let user = HEXLOWER_PERMISSIVE
        .decode(user_hex.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())?;

    Some(Challenge {
        challenge_type: challenge_type.to_owned(),
        user,
        nonce: nonce.to_owned(),
        salt: salt.to_owned(),
    })
}

/// The `crypt1` construction: the salted password digest keys an HMAC
/// over the challenge nonce.
pub fn crypt1_response(password: &str, nonce: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let secret = hasher.finalize();

    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(&secret) else {
        return String::new();
    };
    mac.update(nonce.as_bytes());
    HEXLOWER.encode(&mac.finalize().into_bytes())
}

/// Build the reply for an `authorize` control command, or None when the
/// command itself is malformed (which the caller treats as a protocol
/// error). A challenge we cannot answer still gets a reply, with an
/// empty response.
pub fn process_authorize(creds: &Credentials, options: &Map<String, Value>) -> Option<Value> {
    let challenge = options.get("challenge").and_then(Value::as_str)?;
    let cookie = options.get("cookie").and_then(Value::as_i64)?;
    let parsed = parse_challenge(challenge)?;

    let mut response = String::new();
    if parsed.user != creds.user() {
        warn!(
            user = %parsed.user,
            "received authorize command for wrong user"
        );
    } else if parsed.challenge_type == "crypt1" {
        match creds.password() {
            Some(password) => {
                response =
                    crypt1_response(password.expose_secret(), &parsed.nonce, &parsed.salt);
            }
            None => {
                warn!("received authorize crypt1 challenge, but didn't use password to authenticate");
            }
        }
    }

    Some(serde_json::json!({
        "command": "authorize",
        "cookie": cookie,
        "response": response,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchway_common::Secret;
    use serde_json::json;

    fn challenge_for(user: &str) -> String {
        format!("crypt1:{}:nonce77:salt99", HEXLOWER.encode(user.as_bytes()))
    }

    fn creds() -> Credentials {
        Credentials::new(
            "admin",
            Some(Secret::new("hunter2".to_string())),
            None,
            "hatchway",
        )
    }

    #[test]
    fn test_parse_challenge() {
        let parsed = parse_challenge(&challenge_for("admin")).unwrap();
        assert_eq!(parsed.challenge_type, "crypt1");
        assert_eq!(parsed.user, "admin");
        assert_eq!(parsed.nonce, "nonce77");
        assert_eq!(parsed.salt, "salt99");

        assert!(parse_challenge("crypt1:zz-not-hex:n:s").is_none());
        assert!(parse_challenge("crypt1:61646d696e").is_none());
        assert!(parse_challenge("").is_none());
    }

    #[test]
    fn test_response_is_deterministic_and_salted() {
        let a = crypt1_response("hunter2", "nonce", "salt");
        let b = crypt1_response("hunter2", "nonce", "salt");
        let c = crypt1_response("hunter2", "nonce", "other-salt");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_process_authorize_answers_challenge() {
        let creds = creds();
        let options = json!({
            "command": "authorize",
            "challenge": challenge_for("admin"),
            "cookie": 55,
        });
        let reply = process_authorize(&creds, options.as_object().unwrap()).unwrap();
        assert_eq!(reply["command"], json!("authorize"));
        assert_eq!(reply["cookie"], json!(55));
        assert_eq!(
            reply["response"],
            json!(crypt1_response("hunter2", "nonce77", "salt99"))
        );
    }

    #[test]
    fn test_process_authorize_wrong_user_gets_empty_response() {
        let creds = creds();
        let options = json!({
            "command": "authorize",
            "challenge": challenge_for("root"),
            "cookie": 1,
        });
        let reply = process_authorize(&creds, options.as_object().unwrap()).unwrap();
        assert_eq!(reply["response"], json!(""));
    }

    #[test]
    fn test_process_authorize_without_password_gets_empty_response() {
        let creds = Credentials::new("admin", None, None, "hatchway");
        let options = json!({
            "command": "authorize",
            "challenge": challenge_for("admin"),
            "cookie": 1,
        });
        let reply = process_authorize(&creds, options.as_object().unwrap()).unwrap();
        assert_eq!(reply["response"], json!(""));
    }

    #[test]
    fn test_process_authorize_malformed_is_rejected() {
        let creds = creds();
        let options = json!({"command": "authorize", "cookie": 1});
        assert!(process_authorize(&creds, options.as_object().unwrap()).is_none());

        let options = json!({"command": "authorize", "challenge": challenge_for("admin")});
        assert!(process_authorize(&creds, options.as_object().unwrap()).is_none());

        let options = json!({"command": "authorize", "challenge": "not-a-challenge", "cookie": 1});
        assert!(process_authorize(&creds, options.as_object().unwrap()).is_none());
    }
}
