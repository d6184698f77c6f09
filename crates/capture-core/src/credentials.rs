//! Time-limited relay (TURN) credentials
//!
//! Implements the TURN REST shared-secret scheme: the username is the expiry
//! timestamp and the password is `base64(HMAC-SHA1(secret, username))`, so the
//! relay server can verify it without any shared state.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::config::TurnConfig;
use crate::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Credential set handed to a peer for relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub ttl: u64,
}

impl RelayCredentials {
    /// ICE server entry for a WebRTC configuration
    pub fn ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            ..Default::default()
        }
    }
}

/// Mints relay credentials from the configured shared secret
#[derive(Debug, Clone)]
pub struct CredentialMinter {
    secret: Option<String>,
    host: String,
    enable_turns: bool,
    ttl_secs: u64,
}

impl CredentialMinter {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            secret: config.secret.clone().filter(|s| !s.is_empty()),
            host: turn_host(config),
            enable_turns: config.enable_turns,
            ttl_secs: config.ttl_secs,
        }
    }

    /// Whether a shared secret is provisioned
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Relay host the URLs point at
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Mint credentials valid for the configured TTL starting now
    pub fn mint(&self) -> Result<RelayCredentials> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.mint_at(now, self.ttl_secs)
    }

    /// Mint credentials for an explicit clock reading
    pub fn mint_at(&self, now_unix: u64, ttl_secs: u64) -> Result<RelayCredentials> {
        let secret = self.secret.as_deref().ok_or(Error::RelayNotConfigured)?;

        let username = (now_unix + ttl_secs).to_string();
        let credential = relay_password(secret, &username)?;

        let mut urls = vec![format!("turn:{}:3478?transport=udp", self.host)];
        if self.enable_turns {
            urls.push(format!("turns:{}:5349?transport=tcp", self.host));
        }

        Ok(RelayCredentials {
            urls,
            username,
            credential,
            ttl: ttl_secs,
        })
    }

    /// WebRTC configuration for the server side of a session.
    ///
    /// With a secret the server is forced through the relay; without one the
    /// configuration carries no ICE servers and relies on direct connectivity.
    pub fn server_rtc_configuration(&self) -> RTCConfiguration {
        match self.mint() {
            Ok(credentials) => RTCConfiguration {
                ice_servers: vec![credentials.ice_server()],
                ice_transport_policy: RTCIceTransportPolicy::Relay,
                ..Default::default()
            },
            Err(_) => RTCConfiguration::default(),
        }
    }
}

/// `base64(HMAC-SHA1(secret, username))`
pub fn relay_password(secret: &str, username: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidConfig(format!("Invalid relay secret: {}", e)))?;
    mac.update(username.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Relay hostname: explicit override, else `turn.<frontend host>`
pub fn turn_host(config: &TurnConfig) -> String {
    if let Some(host) = config.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }
    let frontend = frontend_host(&config.frontend_domain);
    if frontend.starts_with("turn.") {
        frontend
    } else {
        format!("turn.{}", frontend)
    }
}

/// Strip scheme, path and trailing slashes from a frontend domain
fn frontend_host(domain: &str) -> String {
    let trimmed = domain.trim().trim_end_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(secret: Option<&str>) -> TurnConfig {
        TurnConfig {
            secret: secret.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_mint_known_vector() {
        let minter = CredentialMinter::new(&config(Some("s3cret")));
        let creds = minter.mint_at(1_700_000_000, 3600).unwrap();

        assert_eq!(creds.username, "1700003600");
        assert_eq!(creds.credential, "hkHv/K58ZdACCJ9F4MWT46M317I=");
        assert_eq!(creds.ttl, 3600);
        assert_eq!(creds.urls, vec!["turn:turn.anqa.cloud:3478?transport=udp"]);
    }

    #[test]
    fn test_mint_is_deterministic() {
        let minter = CredentialMinter::new(&config(Some("another")));
        let a = minter.mint_at(1_700_000_000, 60).unwrap();
        let b = minter.mint_at(1_700_000_000, 60).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.username, "1700000060");
        assert_eq!(a.credential, "Pnj16PLJeyi8jdJFF6PsGEKIcc4=");
        assert_eq!(a.credential, relay_password("another", "1700000060").unwrap());
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let minter = CredentialMinter::new(&config(None));
        assert!(!minter.is_configured());

        let err = minter.mint().unwrap_err();
        assert!(matches!(err, Error::RelayNotConfigured));
        assert!(err.is_config_error());

        let empty = CredentialMinter::new(&config(Some("")));
        assert!(!empty.is_configured());
    }

    #[test]
    fn test_turns_url_when_enabled() {
        let mut cfg = config(Some("s3cret"));
        cfg.enable_turns = true;
        cfg.host = Some("relay.example.org".to_string());

        let creds = CredentialMinter::new(&cfg).mint_at(0, 10).unwrap();
        assert_eq!(
            creds.urls,
            vec![
                "turn:relay.example.org:3478?transport=udp",
                "turns:relay.example.org:5349?transport=tcp",
            ]
        );
    }

    #[test]
    fn test_turn_host_resolution() {
        let mut cfg = config(None);
        cfg.frontend_domain = "https://app.example.org/".to_string();
        assert_eq!(turn_host(&cfg), "turn.app.example.org");

        cfg.frontend_domain = "turn.example.org".to_string();
        assert_eq!(turn_host(&cfg), "turn.example.org");

        cfg.host = Some("  ".to_string());
        assert_eq!(turn_host(&cfg), "turn.example.org");

        cfg.host = Some("edge.example.net".to_string());
        assert_eq!(turn_host(&cfg), "edge.example.net");
    }

    #[test]
    fn test_server_configuration_policy() {
        let relay = CredentialMinter::new(&config(Some("s3cret"))).server_rtc_configuration();
        assert_eq!(relay.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(relay.ice_servers.len(), 1);

        let direct = CredentialMinter::new(&config(None)).server_rtc_configuration();
        assert!(direct.ice_servers.is_empty());
        assert_ne!(direct.ice_transport_policy, RTCIceTransportPolicy::Relay);
    }
}
