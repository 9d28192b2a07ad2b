// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::TransportError;
use hmac::{Hmac, Mac};
use ingest_common::domain::{CorrelationId, Envelope, PongPayload};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::{Instant, sleep};

/// Cadence of the `wait_for_online` poll.
const ONLINE_POLL_INTERVAL: Duration = Duration::from_millis(120);

/// Nonces older than this cannot be redeemed anymore.
const NONCE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde", default = "interval_default")]
    pub interval: Duration,

    #[serde(default = "multiplier_default")]
    pub multiplier: f64,

    #[serde(with = "humantime_serde", default = "max_interval_default")]
    pub max_interval: Duration,

    /// A pong older than this no longer counts as online.
    #[serde(with = "humantime_serde", default = "stale_after_default")]
    pub stale_after: Duration,

    /// Plain shared secret the peer echoes in its pong.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: interval_default(),
            multiplier: multiplier_default(),
            max_interval: max_interval_default(),
            stale_after: stale_after_default(),
            password: None,
        }
    }
}

fn interval_default() -> Duration {
    Duration::from_millis(600)
}

fn multiplier_default() -> f64 {
    1.6
}

fn max_interval_default() -> Duration {
    Duration::from_secs(5)
}

fn stale_after_default() -> Duration {
    Duration::from_secs(15)
}

/// Liveness state fed by the ping/pong exchange. The ping schedule backs off exponentially and is
/// reset whenever someone actively waits for the peer to come online.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<Inner>,
}

struct Inner {
    config: HeartbeatConfig,
    online: AtomicBool,
    last_pong_at: Mutex<Option<Instant>>,
    current_interval: Mutex<Duration>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        let current_interval = Mutex::new(config.interval);

        Self {
            inner: Arc::new(Inner {
                config,
                online: AtomicBool::new(false),
                last_pong_at: Mutex::new(None),
                current_interval,
            }),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.inner.config
    }

    /// Online means a valid pong arrived and is not yet stale.
    pub fn is_online(&self) -> bool {
        if !self.inner.online.load(Ordering::Acquire) {
            return false;
        }

        self.inner
            .last_pong_at
            .lock()
            .is_some_and(|at| at.elapsed() < self.inner.config.stale_after)
    }

    /// Check the pong against the configured password and record it if valid. An invalid pong is
    /// dropped without touching the online state.
    pub fn record_pong(&self, pong: &PongPayload) -> bool {
        if let Some(password) = &self.inner.config.password {
            if pong.password.as_deref() != Some(password.as_str()) {
                self.inner.online.store(false, Ordering::Release);
                return false;
            }
        }

        *self.inner.last_pong_at.lock() = Some(Instant::now());
        self.inner.online.store(true, Ordering::Release);
        true
    }

    pub fn mark_offline(&self) {
        self.inner.online.store(false, Ordering::Release);
    }

    /// Current ping delay; each call advances the exponential backoff.
    pub fn next_interval(&self) -> Duration {
        let mut current = self.inner.current_interval.lock();
        let interval = *current;

        *current = Duration::from_secs_f64(
            (interval.as_secs_f64() * self.inner.config.multiplier)
                .min(self.inner.config.max_interval.as_secs_f64()),
        );

        interval
    }

    pub fn reset_backoff(&self) {
        *self.inner.current_interval.lock() = self.inner.config.interval;
    }

    /// Validate a pong envelope and record it. With a token configured, the pong must mirror a
    /// ping's correlation ID and prove knowledge of the token via the challenge nonce; an invalid
    /// proof drops the pong without touching the online state.
    pub fn accept_pong(
        &self,
        envelope: &Envelope,
        token: Option<&str>,
        challenges: &NonceBucket,
        sid: Option<&str>,
    ) -> bool {
        let Ok(pong) = envelope.payload_as::<PongPayload>() else {
            return false;
        };

        if let Some(token) = token {
            let Some(correlation_id) = envelope.correlation_id else {
                return false;
            };
            let Some((nonce, ts)) = challenges.consume(&correlation_id) else {
                return false;
            };
            let Some(proof) = pong.proof.as_deref() else {
                return false;
            };

            if !verify_proof(token, &nonce, ts, sid, proof) {
                return false;
            }
        }

        self.record_pong(&pong)
    }

    /// Poll until online, resetting the backoff each iteration to accelerate the next ping.
    pub async fn wait_for_online(&self, deadline: Duration) -> Result<(), TransportError> {
        let started_at = Instant::now();

        loop {
            if self.is_online() {
                return Ok(());
            }

            if started_at.elapsed() >= deadline {
                return Err(TransportError::NotOnline(deadline));
            }

            self.reset_backoff();
            sleep(ONLINE_POLL_INTERVAL).await;
        }
    }
}

/// Proof for a ping challenge: `HMAC_SHA256(token, nonce|ts[|sid])`, hex-encoded.
pub fn compute_proof(token: &str, nonce: &str, ts: u64, sid: Option<&str>) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(token.as_bytes())
        .expect("HMAC accepts keys of any length");

    mac.update(nonce.as_bytes());
    mac.update(b"|");
    mac.update(ts.to_string().as_bytes());
    if let Some(sid) = sid {
        mac.update(b"|");
        mac.update(sid.as_bytes());
    }

    const_hex::encode(mac.finalize().into_bytes())
}

pub fn verify_proof(token: &str, nonce: &str, ts: u64, sid: Option<&str>, proof: &str) -> bool {
    let Ok(proof) = const_hex::decode(proof) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(token.as_bytes())
        .expect("HMAC accepts keys of any length");

    mac.update(nonce.as_bytes());
    mac.update(b"|");
    mac.update(ts.to_string().as_bytes());
    if let Some(sid) = sid {
        mac.update(b"|");
        mac.update(sid.as_bytes());
    }

    mac.verify_slice(&proof).is_ok()
}

/// Single-use nonce store for ping challenges, scoped to one socket/channel. Challenges are keyed
/// by the ping's correlation ID, which the pong must mirror.
#[derive(Default)]
pub struct NonceBucket {
    issued: Mutex<HashMap<CorrelationId, Challenge>>,
}

struct Challenge {
    nonce: String,
    ts: u64,
    issued_at: Instant,
}

impl NonceBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh nonce for the ping with the given correlation ID and timestamp.
    pub fn issue(&self, correlation_id: CorrelationId, ts: u64) -> String {
        let nonce = const_hex::encode(rand::random::<[u8; 16]>());

        let mut issued = self.issued.lock();
        issued.retain(|_, challenge| challenge.issued_at.elapsed() < NONCE_TTL);
        issued.insert(
            correlation_id,
            Challenge {
                nonce: nonce.clone(),
                ts,
                issued_at: Instant::now(),
            },
        );

        nonce
    }

    /// Redeem the challenge for a mirrored correlation ID; each nonce validates exactly one pong.
    pub fn consume(&self, correlation_id: &CorrelationId) -> Option<(String, u64)> {
        let mut issued = self.issued.lock();
        issued.retain(|_, challenge| challenge.issued_at.elapsed() < NONCE_TTL);
        issued
            .remove(correlation_id)
            .map(|challenge| (challenge.nonce, challenge.ts))
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{
        Heartbeat, HeartbeatConfig, NonceBucket, compute_proof, verify_proof,
    };
    use ingest_common::domain::PongPayload;
    use std::time::Duration;

    fn pong(password: Option<&str>) -> PongPayload {
        PongPayload {
            password: password.map(str::to_string),
            proof: None,
        }
    }

    #[test]
    fn test_password_validation() {
        let heartbeat = Heartbeat::new(HeartbeatConfig {
            password: Some("pw".to_string()),
            ..HeartbeatConfig::default()
        });

        assert!(!heartbeat.is_online());

        assert!(heartbeat.record_pong(&pong(Some("pw"))));
        assert!(heartbeat.is_online());

        // A bad pong drops liveness until the next valid one.
        assert!(!heartbeat.record_pong(&pong(Some("bad"))));
        assert!(!heartbeat.is_online());

        assert!(heartbeat.record_pong(&pong(Some("pw"))));
        assert!(heartbeat.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness() {
        let heartbeat = Heartbeat::new(HeartbeatConfig {
            stale_after: Duration::from_secs(15),
            ..HeartbeatConfig::default()
        });

        heartbeat.record_pong(&pong(None));
        assert!(heartbeat.is_online());

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(!heartbeat.is_online());
    }

    #[test]
    fn test_backoff_schedule() {
        let heartbeat = Heartbeat::new(HeartbeatConfig::default());

        assert_eq!(heartbeat.next_interval(), Duration::from_millis(600));
        assert_eq!(heartbeat.next_interval(), Duration::from_millis(960));

        for _ in 0..10 {
            heartbeat.next_interval();
        }
        assert_eq!(heartbeat.next_interval(), Duration::from_secs(5));

        heartbeat.reset_backoff();
        assert_eq!(heartbeat.next_interval(), Duration::from_millis(600));
    }

    #[test]
    fn test_proof_round_trip() {
        let proof = compute_proof("token", "nonce", 42, Some("sid"));

        assert!(verify_proof("token", "nonce", 42, Some("sid"), &proof));
        assert!(!verify_proof("token", "nonce", 43, Some("sid"), &proof));
        assert!(!verify_proof("other", "nonce", 42, Some("sid"), &proof));
        assert!(!verify_proof("token", "nonce", 42, None, &proof));
    }

    #[test]
    fn test_nonce_single_use() {
        let bucket = NonceBucket::new();
        let correlation_id = uuid::Uuid::now_v7();
        let nonce = bucket.issue(correlation_id, 42);

        assert_eq!(bucket.consume(&correlation_id), Some((nonce, 42)));
        assert_eq!(bucket.consume(&correlation_id), None);
        assert_eq!(bucket.consume(&uuid::Uuid::now_v7()), None);
    }

    #[test]
    fn test_accept_pong_with_proof() {
        use crate::domain::NonceBucket;
        use ingest_common::domain::{Action, Envelope};

        let heartbeat = Heartbeat::new(HeartbeatConfig::default());
        let challenges = NonceBucket::new();

        let ping = Envelope::request(
            Action::Ping,
            &ingest_common::domain::PingPayload {
                ts: 42,
                nonce: None,
                sid: Some("sid-1".to_string()),
            },
        )
        .expect("ping can be built");
        let correlation_id = ping.correlation_id.expect("correlation id present");
        let nonce = challenges.issue(correlation_id, 42);

        let proof = compute_proof("token", &nonce, 42, Some("sid-1"));
        let pong = Envelope::response_to(
            &ping,
            Action::Pong,
            &PongPayload {
                password: None,
                proof: Some(proof.clone()),
            },
        )
        .expect("pong can be built");

        assert!(heartbeat.accept_pong(&pong, Some("token"), &challenges, Some("sid-1")));
        assert!(heartbeat.is_online());

        // The nonce is single-use; replaying the same pong is rejected.
        heartbeat.mark_offline();
        assert!(!heartbeat.accept_pong(&pong, Some("token"), &challenges, Some("sid-1")));
        assert!(!heartbeat.is_online());
    }
}
