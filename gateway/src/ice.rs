//! Time-limited TURN credentials in the coturn "REST API" shape.
//!
//! The username is `<expiry_unix>:<identity>` and the password is the hex
//! HMAC-SHA1 of that username under the secret shared with the TURN server.
//! An empty secret still yields a credential; the TURN server rejects it.

use chrono::{DateTime, Duration, Utc};
use common_net::message::IceServer;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;

use crate::BoxError;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IceError {
    #[error("credential ttl of {0}s is out of range")]
    Ttl(u64),
}

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    pub host: String,
    pub port: u16,
    pub tls_port: u16,
    pub secret: String,
    pub ttl_secs: u64,
    pub include_stun: bool,
    pub stun_urls: Vec<String>,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3478,
            tls_port: 5349,
            secret: String::new(),
            ttl_secs: 86_400,
            include_stun: true,
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TurnSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let defaults = Self::default();
        let host = std::env::var("COTURN_HOST").unwrap_or(defaults.host);
        let port = match std::env::var("COTURN_PORT") {
            Ok(v) => v.parse().map_err(|e| Box::new(e) as BoxError)?,
            Err(_) => defaults.port,
        };
        let tls_port = match std::env::var("COTURN_TLS_PORT") {
            Ok(v) => v.parse().map_err(|e| Box::new(e) as BoxError)?,
            Err(_) => defaults.tls_port,
        };
        let secret = std::env::var("COTURN_SECRET").unwrap_or(defaults.secret);
        let ttl_secs = match std::env::var("COTURN_TTL") {
            Ok(v) => v.parse().map_err(|e| Box::new(e) as BoxError)?,
            Err(_) => defaults.ttl_secs,
        };
        let include_stun = match std::env::var("ICE_INCLUDE_STUN") {
            Ok(v) => v.parse().map_err(|e| Box::new(e) as BoxError)?,
            Err(_) => defaults.include_stun,
        };
        let stun_urls = match std::env::var("STUN_URLS") {
            Ok(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.stun_urls,
        };
        let settings = Self {
            host,
            port,
            tls_port,
            secret,
            ttl_secs,
            include_stun,
            stun_urls,
        };
        settings.ttl()?;
        Ok(settings)
    }

    /// `ttl_secs` as a duration, provided an expiry computed from now fits
    /// the calendar.
    pub fn ttl(&self) -> Result<Duration, IceError> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or(IceError::Ttl(self.ttl_secs))
    }

    pub fn turn_urls(&self) -> Vec<String> {
        vec![
            format!("turn:{}:{}", self.host, self.port),
            format!("turn:{}:{}?transport=tcp", self.host, self.port),
            format!("turns:{}:{}?transport=tcp", self.host, self.tls_port),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredential {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub credential_type: String,
    pub expires_at: DateTime<Utc>,
}

impl From<TurnCredential> for IceServer {
    fn from(cred: TurnCredential) -> Self {
        IceServer {
            urls: cred.urls,
            username: Some(cred.username),
            credential: Some(cred.credential),
            credential_type: Some(cred.credential_type),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IceIssuer {
    settings: TurnSettings,
    ttl: Duration,
}

impl IceIssuer {
    pub fn new(settings: TurnSettings) -> Result<Self, IceError> {
        let ttl = settings.ttl()?;
        Ok(Self { settings, ttl })
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    pub fn generate(&self, identity: &str, ttl: Duration) -> TurnCredential {
        self.generate_at(identity, ttl, Utc::now())
    }

    pub fn generate_at(&self, identity: &str, ttl: Duration, now: DateTime<Utc>) -> TurnCredential {
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let username = format!("{}:{}", expires_at.timestamp(), identity);
        let credential = self.sign(&username);
        TurnCredential {
            urls: self.settings.turn_urls(),
            username,
            credential,
            credential_type: "password".to_string(),
            expires_at,
        }
    }

    /// Discovery servers (when requested) followed by one fresh TURN entry.
    pub fn ice_servers(&self, identity: &str, include_discovery: bool) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if include_discovery && !self.settings.stun_urls.is_empty() {
            servers.extend(self.settings.stun_urls.iter().map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
                credential_type: None,
            }));
        }
        servers.push(self.generate(identity, self.default_ttl()).into());
        servers
    }

    /// Same acceptance rule the TURN server applies.
    pub fn verify_at(&self, username: &str, credential: &str, now: DateTime<Utc>) -> bool {
        let Some((expiry, _)) = username.split_once(':') else {
            return false;
        };
        let Ok(expiry) = expiry.parse::<i64>() else {
            return false;
        };
        if now.timestamp() > expiry {
            return false;
        }
        let Ok(presented) = hex::decode(credential) else {
            return false;
        };
        self.mac(username).verify_slice(&presented).is_ok()
    }

    fn sign(&self, username: &str) -> String {
        hex::encode(self.mac(username).finalize().into_bytes())
    }

    fn mac(&self, username: &str) -> HmacSha1 {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(self.settings.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(username.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(secret: &str) -> IceIssuer {
        IceIssuer::new(TurnSettings {
            host: "turn.example.org".into(),
            secret: secret.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn username_carries_expiry_and_identity() {
        let issuer = issuer("s3cret");
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let cred = issuer.generate_at("ana", Duration::hours(24), now);

        assert_eq!(cred.username, "1700086400:ana");
        assert_eq!(cred.credential.len(), 40);
        assert_eq!(cred.credential_type, "password");
        assert_eq!(
            cred.urls,
            vec![
                "turn:turn.example.org:3478",
                "turn:turn.example.org:3478?transport=tcp",
                "turns:turn.example.org:5349?transport=tcp",
            ]
        );
    }

    #[test]
    fn credential_matches_known_hmac() {
        // HMAC-SHA1("key", "The quick brown fox jumps over the lazy dog")
        let issuer = issuer("key");
        assert_eq!(
            issuer.sign("The quick brown fox jumps over the lazy dog"),
            "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9"
        );
    }

    #[test]
    fn validity_window() {
        let issuer = issuer("s3cret");
        let now = Utc::now();
        let ttl = Duration::minutes(10);
        let cred = issuer.generate_at("bo", ttl, now);

        assert!(issuer.verify_at(&cred.username, &cred.credential, now));
        assert!(issuer.verify_at(&cred.username, &cred.credential, now + ttl));
        assert!(!issuer.verify_at(
            &cred.username,
            &cred.credential,
            now + ttl + Duration::seconds(1)
        ));
        assert!(!issuer.verify_at(&cred.username, "00", now));
        assert!(!issuer.verify_at(&cred.username, "not hex", now));
        assert!(issuer.verify_at(&cred.username, &cred.credential.to_uppercase(), now));
    }

    #[test]
    fn unrepresentable_ttl_is_refused() {
        for ttl_secs in [u64::MAX, 10_000_000_000_000_000, 9_000_000_000_000] {
            let settings = TurnSettings {
                ttl_secs,
                ..Default::default()
            };
            assert_eq!(IceIssuer::new(settings).unwrap_err(), IceError::Ttl(ttl_secs));
        }

        let issuer = issuer("s3cret");
        assert_eq!(issuer.default_ttl(), Duration::hours(24));
        let far = issuer.generate_at("ana", Duration::MAX, Utc::now());
        assert_eq!(far.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn empty_secret_fails_open() {
        let open = issuer("");
        let real = issuer("real");
        let now = Utc::now();
        let cred = open.generate_at("ana", Duration::hours(1), now);
        assert!(!cred.credential.is_empty());
        assert!(!real.verify_at(&cred.username, &cred.credential, now));
    }

    #[test]
    fn ice_servers_order() {
        let issuer = issuer("s3cret");
        let servers = issuer.ice_servers("ana", true);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[0].username.is_none());
        assert_eq!(servers[2].credential_type.as_deref(), Some("password"));

        let turn_only = issuer.ice_servers("ana", false);
        assert_eq!(turn_only.len(), 1);
        assert!(turn_only[0].urls[0].starts_with("turn:"));
    }
}
