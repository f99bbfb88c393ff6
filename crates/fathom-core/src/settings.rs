//! Per-session configuration surface.
//!
//! An open key→value map rather than a closed struct: consumers may set
//! anything, the engine documents the keys it consumes in [`keys`]. All
//! values are optional; typed accessors fall back to a caller default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Keys consumed by the engine. Capability keys double as overrides:
/// FEAT fills them in after login, but a consumer may force-disable a
/// misbehaving server's advertised capability at any time.
pub mod keys {
    pub const RETRY: &str = "retry";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const RETRY_DELAY: &str = "retryDelay";

    pub const USE_SSL: &str = "ssl";
    pub const SSL_IMPLICIT: &str = "sslImplicit";
    pub const SSL_IGNORE_ERRORS: &str = "sslIgnoreErrors";
    /// Data-channel protection: "P" (private) or "C" (clear).
    pub const SSL_PROT_MODE: &str = "sslProtMode";

    pub const FEAT_MDTM: &str = "feat.mdtm";
    pub const FEAT_PRET: &str = "feat.pret";
    pub const FEAT_MLSD: &str = "feat.mlsd";
    pub const FEAT_REST: &str = "feat.rest";
    pub const FEAT_SSCN: &str = "feat.sscn";
    pub const FEAT_CPSV: &str = "feat.cpsv";
    pub const FEAT_EPSV: &str = "feat.epsv";
    pub const FEAT_EPRT: &str = "feat.eprt";
    pub const FEAT_PASV: &str = "feat.pasv";
    pub const FEAT_STAT: &str = "feat.statList";

    pub const ACTIVE_PORT_MIN: &str = "activePortMin";
    pub const ACTIVE_PORT_MAX: &str = "activePortMax";
    /// Forced external IP reported in PORT/EPRT, overriding the local
    /// socket address.
    pub const ACTIVE_EXTERNAL_IP: &str = "activeExternalIp";
    /// When set, trust the address a server reports in PASV even if it is
    /// in a private range.
    pub const PASV_TRUST_PRIVATE: &str = "pasvTrustPrivate";

    pub const KEEPALIVE: &str = "keepalive";
    pub const KEEPALIVE_INTERVAL: &str = "keepaliveInterval";

    /// Remote text encoding label ("utf-8", "latin1", ...).
    pub const ENCODING: &str = "encoding";

    pub const CONTROL_TIMEOUT: &str = "controlTimeout";
    pub const DATA_TIMEOUT: &str = "dataTimeout";

    /// SFTP public-key auth.
    pub const SFTP_KEY_PATH: &str = "sftp.keyPath";
    pub const SFTP_KEY_PASSPHRASE: &str = "sftp.keyPassphrase";
    /// Expected host-key fingerprint (hex SHA-256); empty = first use.
    pub const SFTP_HOST_FINGERPRINT: &str = "sftp.hostFingerprint";
}

/// Arbitrary key→value settings attached to one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    values: HashMap<String, String>,
}

impl SessionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn unset(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v, "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_fall_back() {
        let mut s = SessionSettings::new();
        assert!(!s.get_bool(keys::RETRY, false));
        assert_eq!(s.get_u32(keys::RETRY_COUNT, 3), 3);

        s.set(keys::RETRY, true);
        s.set(keys::RETRY_COUNT, 5u32);
        s.set(keys::ENCODING, "latin1");
        assert!(s.get_bool(keys::RETRY, false));
        assert_eq!(s.get_u32(keys::RETRY_COUNT, 3), 5);
        assert_eq!(s.get_str(keys::ENCODING, "utf-8"), "latin1");

        s.unset(keys::RETRY);
        assert!(!s.get_bool(keys::RETRY, false));
    }

    #[test]
    fn capability_override_round_trip() {
        let mut s = SessionSettings::new();
        s.set(keys::FEAT_EPSV, true);
        assert!(s.get_bool(keys::FEAT_EPSV, false));
        s.set(keys::FEAT_EPSV, false);
        assert!(!s.get_bool(keys::FEAT_EPSV, true));
    }
}
