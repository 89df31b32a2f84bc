//! Credential resolution
//!
//! Turns the credential references in `hosts.json` into `AuthMethod`s by
//! reading the named environment variables.

use super::storage::StorageError;
use super::types::SavedAuth;
use crate::ssh::AuthMethod;

/// Resolve credentials from the process environment
pub fn resolve_auth(host_id: &str, saved: &SavedAuth) -> Result<AuthMethod, StorageError> {
    resolve_auth_with(host_id, saved, |name| std::env::var(name).ok())
}

/// Resolve credentials through an arbitrary variable lookup
pub fn resolve_auth_with<F>(
    host_id: &str,
    saved: &SavedAuth,
    lookup: F,
) -> Result<AuthMethod, StorageError>
where
    F: Fn(&str) -> Option<String>,
{
    match saved {
        SavedAuth::Password { password_env } => {
            let password = lookup(password_env).ok_or_else(|| StorageError::MissingCredential {
                host: host_id.to_string(),
                variable: password_env.clone(),
            })?;
            Ok(AuthMethod::password(password))
        }
        SavedAuth::Key {
            key_path,
            passphrase_env,
        } => {
            let passphrase = match passphrase_env {
                Some(var) => Some(lookup(var).ok_or_else(|| StorageError::MissingCredential {
                    host: host_id.to_string(),
                    variable: var.clone(),
                })?),
                None => None,
            };
            Ok(AuthMethod::key(expand_home(key_path), passphrase))
        }
    }
}

/// Expand a leading `~/` against the home directory
fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_password() {
        let vars = env(&[("ALPHA_PW", "s3cret")]);
        let saved = SavedAuth::Password {
            password_env: "ALPHA_PW".to_string(),
        };

        let auth = resolve_auth_with("alpha", &saved, |k| vars.get(k).cloned()).unwrap();
        assert_eq!(auth, AuthMethod::password("s3cret"));
    }

    #[test]
    fn test_missing_password_names_variable() {
        let saved = SavedAuth::Password {
            password_env: "BETA_PW".to_string(),
        };

        let err = resolve_auth_with("beta", &saved, |_| None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("beta"));
        assert!(msg.contains("BETA_PW"));
    }

    #[test]
    fn test_resolve_key_with_and_without_passphrase() {
        let vars = env(&[("KEY_PASS", "phrase")]);

        let saved = SavedAuth::Key {
            key_path: "/keys/alpha".to_string(),
            passphrase_env: Some("KEY_PASS".to_string()),
        };
        let auth = resolve_auth_with("alpha", &saved, |k| vars.get(k).cloned()).unwrap();
        assert_eq!(auth, AuthMethod::key("/keys/alpha", Some("phrase".to_string())));

        let saved = SavedAuth::Key {
            key_path: "/keys/alpha".to_string(),
            passphrase_env: None,
        };
        let auth = resolve_auth_with("alpha", &saved, |_| None).unwrap();
        assert_eq!(auth, AuthMethod::key("/keys/alpha", None));
    }

    #[test]
    fn test_missing_passphrase_is_an_error() {
        let saved = SavedAuth::Key {
            key_path: "/keys/alpha".to_string(),
            passphrase_env: Some("NOPE".to_string()),
        };
        assert!(resolve_auth_with("alpha", &saved, |_| None).is_err());
    }
}
