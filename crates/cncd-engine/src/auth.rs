//! Session authentication
//!
//! Three checks gate every client session: the bearer token must verify
//! against the configured secret, the remote address must satisfy the
//! ordered IP access rules (first match wins, default allow), and the
//! user carried in the token must appear enabled in the configured user
//! list (an empty list leaves that check open).

use cncd_core::{Error, Result};
use cncd_settings::{AccessRule, AuthSettings, UserRecord};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Claims carried by a session bearer token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// User id
    pub id: String,
    /// User display name
    pub name: String,
    /// Expiry, seconds since the epoch
    pub exp: u64,
}

/// Verify a bearer token against the configured secret
pub fn verify_token(token: &str, secret: &str) -> Result<AuthClaims> {
    let data = decode::<AuthClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| Error::auth(format!("invalid token: {e}")))?;
    Ok(data.claims)
}

/// Check the remote address against the ordered access rules.
///
/// Rules are prefix matches on the printed address; `*` matches
/// everything. No matching rule allows the address.
pub fn check_ip(rules: &[AccessRule], remote: IpAddr) -> bool {
    let addr = remote.to_string();
    for rule in rules {
        if rule.ip == "*" || addr.starts_with(&rule.ip) {
            return rule.allow;
        }
    }
    true
}

/// Check the token's user against the configured list.
///
/// An empty list is open; otherwise the user must exist, match by id and
/// name, and be enabled.
pub fn check_user(users: &[UserRecord], claims: &AuthClaims) -> bool {
    if users.is_empty() {
        return true;
    }
    users
        .iter()
        .any(|u| u.enabled && u.id == claims.id && u.name == claims.name)
}

/// Run the full handshake: IP rules, token, then user list.
pub fn authenticate(
    settings: &AuthSettings,
    token: Option<&str>,
    remote: IpAddr,
) -> Result<AuthClaims> {
    if !check_ip(&settings.access_rules, remote) {
        return Err(Error::auth(format!("address {remote} is blocked")));
    }
    let token = token.ok_or_else(|| Error::auth("missing bearer token"))?;
    let claims = verify_token(token, &settings.secret)?;
    if !check_user(&settings.users, &claims) {
        return Err(Error::auth(format!(
            "user {} is not enabled",
            claims.name
        )));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn token_for(id: &str, name: &str, secret: &str) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        let claims = AuthClaims {
            id: id.to_string(),
            name: name.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn settings() -> AuthSettings {
        AuthSettings {
            secret: SECRET.to_string(),
            users: Vec::new(),
            access_rules: Vec::new(),
        }
    }

    #[test]
    fn valid_token_passes() {
        let token = token_for("u1", "operator", SECRET);
        let claims = authenticate(&settings(), Some(&token), "127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(claims.id, "u1");
    }

    #[test]
    fn wrong_secret_and_missing_token_fail() {
        let token = token_for("u1", "operator", "other-secret");
        assert!(authenticate(&settings(), Some(&token), "127.0.0.1".parse().unwrap()).is_err());
        assert!(authenticate(&settings(), None, "127.0.0.1".parse().unwrap()).is_err());
    }

    #[test]
    fn ip_rules_first_match_wins() {
        let rules = vec![
            AccessRule {
                allow: true,
                ip: "192.168.1.".to_string(),
            },
            AccessRule {
                allow: false,
                ip: "*".to_string(),
            },
        ];
        assert!(check_ip(&rules, "192.168.1.7".parse().unwrap()));
        assert!(!check_ip(&rules, "10.0.0.1".parse().unwrap()));
        // No rules: open
        assert!(check_ip(&[], "10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn user_list_gates_when_present() {
        let mut s = settings();
        s.users.push(UserRecord {
            id: "u1".to_string(),
            name: "operator".to_string(),
            enabled: true,
        });
        s.users.push(UserRecord {
            id: "u2".to_string(),
            name: "intern".to_string(),
            enabled: false,
        });

        let ok = token_for("u1", "operator", SECRET);
        assert!(authenticate(&s, Some(&ok), "127.0.0.1".parse().unwrap()).is_ok());

        let disabled = token_for("u2", "intern", SECRET);
        assert!(authenticate(&s, Some(&disabled), "127.0.0.1".parse().unwrap()).is_err());

        let unknown = token_for("u3", "ghost", SECRET);
        assert!(authenticate(&s, Some(&unknown), "127.0.0.1".parse().unwrap()).is_err());
    }
}
