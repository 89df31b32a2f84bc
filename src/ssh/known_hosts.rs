//! Known hosts verification
//!
//! Reads an OpenSSH `known_hosts` file once and answers whether a server key
//! is known, unknown, or has changed. Trusted-on-first-use keys are appended.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// No key of this type recorded for the host
    Unknown { fingerprint: String },
    /// Key differs from the recorded one (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// (key_type, base64_key)
#[derive(Clone, Debug, PartialEq, Eq)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// lookup key -> recorded keys (one host may have several key types)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// ~/.ssh/known_hosts
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    /// Load the store from `path`; a missing file is an empty store
    pub fn with_path(path: PathBuf) -> Self {
        let hosts = match fs::read_to_string(&path) {
            Ok(content) => parse_known_hosts(&content),
            Err(e) => {
                debug!("known_hosts {:?} not loaded: {}", path, e);
                HashMap::new()
            }
        };
        info!("Loaded {} known hosts from {:?}", hosts.len(), path);

        Self {
            hosts: RwLock::new(hosts),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `host` for port 22, `[host]:port` otherwise
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let key_type = key.algorithm().as_str().to_string();
        let key_data = BASE64.encode(key.public_key_bytes());
        self.verify_raw(&Self::make_key(host, port), &key_type, &key_data)
    }

    fn verify_raw(&self, lookup_key: &str, key_type: &str, key_data: &str) -> HostKeyVerification {
        let hosts = self.hosts.read();
        let recorded = hosts
            .get(lookup_key)
            .and_then(|entries| entries.iter().find(|e| e.key_type == key_type));

        match recorded {
            Some(entry) if entry.key_data == key_data => HostKeyVerification::Verified,
            Some(entry) => HostKeyVerification::Changed {
                expected_fingerprint: fingerprint_b64(&entry.key_data),
                actual_fingerprint: fingerprint_b64(key_data),
            },
            None => HostKeyVerification::Unknown {
                fingerprint: fingerprint_b64(key_data),
            },
        }
    }

    /// Record a key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let key_type = key.algorithm().as_str().to_string();
        let key_data = BASE64.encode(key.public_key_bytes());
        self.add_raw(&Self::make_key(host, port), key_type, key_data)
    }

    fn add_raw(&self, lookup_key: &str, key_type: String, key_data: String) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_data)?;

        self.hosts
            .write()
            .entry(lookup_key.to_string())
            .or_default()
            .push(HostKeyEntry { key_type, key_data });

        info!("Added host key for {} to {:?}", lookup_key, self.path);
        Ok(())
    }
}

fn parse_known_hosts(content: &str) -> HashMap<String, Vec<HostKeyEntry>> {
    let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // hostname[,alias] keytype base64key [comment]
        let mut parts = line.split_whitespace();
        let (Some(names), Some(key_type), Some(key_data)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        // @cert-authority / @revoked markers are not handled
        if names.starts_with('@') {
            warn!("Skipping known_hosts marker line: {}", names);
            continue;
        }

        for name in names.split(',') {
            // Hashed hostnames (|1|salt|hash) cannot be matched by name
            if name.starts_with('|') {
                continue;
            }
            hosts.entry(name.to_lowercase()).or_default().push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            });
        }
    }

    hosts
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

fn fingerprint_b64(stored_b64: &str) -> String {
    match BASE64.decode(stored_b64) {
        Ok(bytes) => fingerprint_bytes(&bytes),
        Err(_) => "unknown".to_string(),
    }
}
