//! In-memory timed credentials: admin OTP requests, IP-bound temp admin
//! tokens, replay download sessions, and the IP blacklist.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::net::IpAddr;
use uuid::Uuid;

const OTP_TTL_MINUTES: i64 = 5;
const TEMP_TOKEN_TTL_HOURS: i64 = 4;
const REPLAY_SESSION_TTL_MINUTES: i64 = 30;
const OTP_FAILURE_LIMIT: u32 = 5;
const OTP_FAILURE_BAN_HOURS: i64 = 1;

/// Lowercased URL-safe base64 alphabet used for OTP codes.
const OTP_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";
const OTP_LENGTH: usize = 6;

pub const TEMP_TOKEN_TTL_MILLIS: i64 = TEMP_TOKEN_TTL_HOURS * 60 * 60 * 1000;
pub const REPLAY_SESSION_TTL_MILLIS: i64 = REPLAY_SESSION_TTL_MINUTES * 60 * 1000;

#[derive(Debug, Clone)]
struct OtpRequest {
    otp: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TempToken {
    expires_at: DateTime<Utc>,
    bound_ip: IpAddr,
}

#[derive(Debug, Clone)]
struct ReplaySession {
    user_id: i32,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct TrustStore {
    otp_requests: DashMap<Uuid, OtpRequest>,
    temp_tokens: DashMap<String, TempToken>,
    replay_sessions: DashMap<String, ReplaySession>,
    blacklist: DashMap<IpAddr, DateTime<Utc>>,
    otp_failures: DashMap<IpAddr, (u32, DateTime<Utc>)>,
}

fn loopback_equivalent(left: IpAddr, right: IpAddr) -> bool {
    left == right || (left.is_loopback() && right.is_loopback())
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending OTP request and returns `(ssid, otp)`. The OTP is
    /// surfaced to the operator out of band (server log).
    pub fn create_otp_request(&self) -> (Uuid, String) {
        let mut rng = rand::thread_rng();
        let otp: String = (0..OTP_LENGTH)
            .map(|_| OTP_ALPHABET[rng.gen_range(0..OTP_ALPHABET.len())] as char)
            .collect();
        let ssid = Uuid::new_v4();
        self.otp_requests.insert(
            ssid,
            OtpRequest {
                otp: otp.clone(),
                expires_at: Utc::now() + Duration::minutes(OTP_TTL_MINUTES),
            },
        );
        (ssid, otp)
    }

    /// Consumes an OTP request (single-use) and on success issues a temp
    /// admin token bound to the verifying IP. Repeated failures from one IP
    /// blacklist it for a while.
    pub fn verify_otp(&self, ssid: Uuid, otp: &str, ip: IpAddr) -> Option<String> {
        let request = self.otp_requests.remove(&ssid).map(|(_, request)| request);
        let valid = request.is_some_and(|request| {
            Utc::now() < request.expires_at && request.otp.eq_ignore_ascii_case(otp)
        });
        if !valid {
            self.record_otp_failure(ip);
            return None;
        }
        self.otp_failures.remove(&ip);
        let token = Uuid::new_v4().to_string();
        self.temp_tokens.insert(
            token.clone(),
            TempToken {
                expires_at: Utc::now() + Duration::hours(TEMP_TOKEN_TTL_HOURS),
                bound_ip: ip,
            },
        );
        Some(token)
    }

    fn record_otp_failure(&self, ip: IpAddr) {
        let mut entry = self
            .otp_failures
            .entry(ip)
            .or_insert((0, Utc::now() + Duration::minutes(OTP_TTL_MINUTES)));
        let (count, window_end) = &mut *entry;
        if Utc::now() > *window_end {
            *count = 0;
            *window_end = Utc::now() + Duration::minutes(OTP_TTL_MINUTES);
        }
        *count += 1;
        if *count >= OTP_FAILURE_LIMIT {
            drop(entry);
            self.otp_failures.remove(&ip);
            self.blacklist_ip(ip, Duration::hours(OTP_FAILURE_BAN_HOURS));
            tracing::warn!(%ip, "ip blacklisted after repeated otp failures");
        }
    }

    /// A mismatched or expired presentation evicts the token.
    pub fn validate_temp_token(&self, token: &str, ip: IpAddr) -> bool {
        let Some(entry) = self.temp_tokens.get(token) else {
            return false;
        };
        let expired = Utc::now() >= entry.expires_at;
        let ip_matches = loopback_equivalent(entry.bound_ip, ip);
        drop(entry);
        if expired || !ip_matches {
            self.temp_tokens.remove(token);
            return false;
        }
        true
    }

    pub fn create_replay_session(&self, user_id: i32) -> String {
        let token = Uuid::new_v4().to_string();
        self.replay_sessions.insert(
            token.clone(),
            ReplaySession {
                user_id,
                expires_at: Utc::now() + Duration::minutes(REPLAY_SESSION_TTL_MINUTES),
            },
        );
        token
    }

    pub fn validate_replay_session(&self, token: &str) -> Option<i32> {
        let entry = self.replay_sessions.get(token)?;
        if Utc::now() >= entry.expires_at {
            drop(entry);
            self.replay_sessions.remove(token);
            return None;
        }
        Some(entry.user_id)
    }

    pub fn blacklist_ip(&self, ip: IpAddr, ttl: Duration) {
        self.blacklist.insert(ip, Utc::now() + ttl);
    }

    pub fn remove_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist.remove(&ip).is_some()
    }

    pub fn clear_blacklist(&self) {
        self.blacklist.clear();
    }

    /// Expired entries are evicted lazily here and by the periodic sweep.
    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        let Some(entry) = self.blacklist.get(&ip) else {
            return false;
        };
        if Utc::now() >= *entry {
            drop(entry);
            self.blacklist.remove(&ip);
            return false;
        }
        true
    }

    pub fn blacklist_entries(&self) -> Vec<(IpAddr, DateTime<Utc>)> {
        let now = Utc::now();
        self.blacklist
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Periodic eviction of everything expired. Runs every minute.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.blacklist.retain(|_, expires_at| *expires_at > now);
        self.otp_requests.retain(|_, request| request.expires_at > now);
        self.temp_tokens.retain(|_, token| token.expires_at > now);
        self.replay_sessions.retain(|_, session| session.expires_at > now);
        self.otp_failures.retain(|_, (_, window_end)| *window_end > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    #[test]
    fn otp_flow_issues_ip_bound_token() {
        let trust = TrustStore::new();
        let (ssid, otp) = trust.create_otp_request();
        assert_eq!(otp.len(), OTP_LENGTH);
        let token = trust
            .verify_otp(ssid, &otp.to_uppercase(), CLIENT)
            .expect("case-insensitive verify");
        assert!(trust.validate_temp_token(&token, CLIENT));
        // single-use: the same ssid cannot be verified twice
        assert!(trust.verify_otp(ssid, &otp, CLIENT).is_none());
    }

    #[test]
    fn wrong_otp_is_rejected() {
        let trust = TrustStore::new();
        let (ssid, _) = trust.create_otp_request();
        assert!(trust.verify_otp(ssid, "zzzzzz", CLIENT).is_none());
        // removed on first attempt
        assert!(trust.otp_requests.is_empty());
    }

    #[test]
    fn temp_token_rejects_and_evicts_on_foreign_ip() {
        let trust = TrustStore::new();
        let (ssid, otp) = trust.create_otp_request();
        let token = trust.verify_otp(ssid, &otp, CLIENT).unwrap();
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        assert!(!trust.validate_temp_token(&token, other));
        // evicted: not even the bound ip can use it now
        assert!(!trust.validate_temp_token(&token, CLIENT));
    }

    #[test]
    fn loopback_addresses_are_equivalent() {
        let trust = TrustStore::new();
        let v4_loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (ssid, otp) = trust.create_otp_request();
        let token = trust.verify_otp(ssid, &otp, v4_loopback).unwrap();
        assert!(trust.validate_temp_token(&token, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))));
        assert!(trust.validate_temp_token(&token, IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn blacklist_expires() {
        let trust = TrustStore::new();
        trust.blacklist_ip(CLIENT, Duration::hours(1));
        assert!(trust.is_blacklisted(CLIENT));
        trust.blacklist.insert(CLIENT, Utc::now() - Duration::seconds(1));
        assert!(!trust.is_blacklisted(CLIENT));
        // lazy eviction removed the stale entry
        assert!(trust.blacklist.is_empty());
    }

    #[test]
    fn repeated_otp_failures_blacklist_the_ip() {
        let trust = TrustStore::new();
        for _ in 0..OTP_FAILURE_LIMIT {
            let (ssid, _) = trust.create_otp_request();
            assert!(trust.verify_otp(ssid, "wrong0", CLIENT).is_none());
        }
        assert!(trust.is_blacklisted(CLIENT));
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let trust = TrustStore::new();
        trust.blacklist.insert(CLIENT, Utc::now() - Duration::seconds(5));
        trust.replay_sessions.insert(
            "stale".into(),
            ReplaySession {
                user_id: 1,
                expires_at: Utc::now() - Duration::seconds(5),
            },
        );
        trust.sweep();
        assert!(trust.blacklist.is_empty());
        assert!(trust.replay_sessions.is_empty());
    }

    #[test]
    fn replay_sessions_resolve_to_user() {
        let trust = TrustStore::new();
        let token = trust.create_replay_session(42);
        assert_eq!(trust.validate_replay_session(&token), Some(42));
        assert_eq!(trust.validate_replay_session("missing"), None);
    }
}
