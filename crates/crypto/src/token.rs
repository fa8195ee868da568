use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// How often a fresh secret is rolled in.
const REFRESH_PERIOD: Duration = Duration::from_secs(5 * 60);
/// How long an issued token stays verifiable.
const VALIDITY_PERIOD: Duration = Duration::from_secs(15 * 60);
/// Issued tokens are the HMAC output truncated to this length.
const TOKEN_LEN: usize = 20;

/// Rolling secrets for DHT write tokens.
///
/// A token is HMAC-SHA256(secret, caller ip ‖ caller node id), truncated.
/// Secrets refresh every 5 minutes and verify for 15, so a token survives at
/// least two refreshes, which covers the get_peers → announce_peer window.
pub struct TokenSecrets {
    /// Newest first.
    secrets: VecDeque<([u8; 32], Instant)>,
    refresh: Duration,
    validity: Duration,
}

impl Default for TokenSecrets {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSecrets {
    pub fn new() -> Self {
        Self::with_periods(REFRESH_PERIOD, VALIDITY_PERIOD)
    }

    pub fn with_periods(refresh: Duration, validity: Duration) -> Self {
        Self { secrets: VecDeque::new(), refresh, validity }
    }

    /// Issue a token for a caller.
    pub fn issue(&mut self, ip: IpAddr, node_id: &[u8]) -> Vec<u8> {
        self.issue_at(Instant::now(), ip, node_id)
    }

    /// Check a token presented by a caller against every still-valid secret.
    pub fn verify(&mut self, ip: IpAddr, node_id: &[u8], token: &[u8]) -> bool {
        self.verify_at(Instant::now(), ip, node_id, token)
    }

    pub(crate) fn issue_at(&mut self, now: Instant, ip: IpAddr, node_id: &[u8]) -> Vec<u8> {
        self.roll(now);
        let (secret, _) = self.secrets.front().expect("roll() guarantees a secret");
        Self::compute(secret, ip, node_id)
    }

    pub(crate) fn verify_at(
        &mut self,
        now: Instant,
        ip: IpAddr,
        node_id: &[u8],
        token: &[u8],
    ) -> bool {
        self.roll(now);
        self.secrets
            .iter()
            .any(|(secret, _)| Self::compute(secret, ip, node_id) == token)
    }

    /// Prepend a fresh secret if the newest one has aged past the refresh
    /// period, and drop secrets past their validity.
    fn roll(&mut self, now: Instant) {
        let needs_new = match self.secrets.front() {
            Some((_, created)) => now.duration_since(*created) >= self.refresh,
            None => true,
        };
        if needs_new {
            let mut secret = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut secret);
            self.secrets.push_front((secret, now));
        }
        let validity = self.validity;
        self.secrets
            .retain(|(_, created)| now.duration_since(*created) < validity);
    }

    fn compute(secret: &[u8; 32], ip: IpAddr, node_id: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        match ip {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac.update(node_id);
        mac.finalize().into_bytes()[..TOKEN_LEN].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_issue_then_verify() {
        let mut secrets = TokenSecrets::new();
        let token = secrets.issue(ip(), b"node-1");
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(secrets.verify(ip(), b"node-1", &token));
    }

    #[test]
    fn test_wrong_caller_rejected() {
        let mut secrets = TokenSecrets::new();
        let token = secrets.issue(ip(), b"node-1");
        assert!(!secrets.verify("10.0.0.2".parse().unwrap(), b"node-1", &token));
        assert!(!secrets.verify(ip(), b"node-2", &token));
        assert!(!secrets.verify(ip(), b"node-1", b"not-a-token"));
    }

    #[test]
    fn test_token_survives_one_refresh() {
        let mut secrets = TokenSecrets::new();
        let t0 = Instant::now();
        let token = secrets.issue_at(t0, ip(), b"node-1");
        // One refresh period later a new secret is rolled in, but the old
        // one is still within validity.
        let t1 = t0 + Duration::from_secs(6 * 60);
        assert!(secrets.verify_at(t1, ip(), b"node-1", &token));
    }

    #[test]
    fn test_token_expires_after_validity() {
        let mut secrets = TokenSecrets::new();
        let t0 = Instant::now();
        let token = secrets.issue_at(t0, ip(), b"node-1");
        let t1 = t0 + Duration::from_secs(16 * 60);
        assert!(!secrets.verify_at(t1, ip(), b"node-1", &token));
    }
}
