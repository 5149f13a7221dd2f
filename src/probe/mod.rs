//! Transport candidate probing
//!
//! Before an account is trusted as a channel both legs are checked: the
//! IMAP side with several parallel login round trips (the average latency
//! is recorded), the SMTP side with a single authenticated handshake.
//! Failures are reduced to an [`ErrorCode`].

pub mod imap;
pub mod smtp;
pub mod tls;

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::types::{classify_error, AccountRecord, ErrorCode, ServerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("IMAP probe failed: {0}")]
    Imap(ErrorCode),

    #[error("SMTP probe failed: {0}")]
    Smtp(ErrorCode),
}

impl ProbeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProbeError::Imap(code) | ProbeError::Smtp(code) => *code,
        }
    }
}

/// Network side of the prober. Errors are raw transport text.
#[async_trait]
pub trait MailServerProbe: Send + Sync {
    /// One IMAP connect + login + logout
    async fn imap_attempt(&self, settings: &ServerSettings) -> Result<(), String>;

    /// One authenticated SMTP handshake
    async fn smtp_verify(&self, settings: &ServerSettings, timeout: Duration) -> Result<(), String>;
}

/// Real probe over TCP/TLS
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProbe;

#[async_trait]
impl MailServerProbe for NetworkProbe {
    async fn imap_attempt(&self, settings: &ServerSettings) -> Result<(), String> {
        imap::login_round_trip(settings).await
    }

    async fn smtp_verify(&self, settings: &ServerSettings, timeout: Duration) -> Result<(), String> {
        smtp::verify(settings, timeout).await
    }
}

pub struct TransportProber {
    probe: Arc<dyn MailServerProbe>,
    attempts: usize,
    timeout: Duration,
}

impl TransportProber {
    pub fn new(probe: Arc<dyn MailServerProbe>, attempts: usize, timeout: Duration) -> Self {
        Self {
            probe,
            attempts: attempts.max(1),
            timeout,
        }
    }

    pub fn from_config(probe: Arc<dyn MailServerProbe>, config: &SessionConfig) -> Self {
        Self::new(probe, config.probe_attempts, config.probe_timeout())
    }

    /// Run all attempts in parallel and return the rounded average latency
    /// in milliseconds. The first failure fails the probe and abandons the
    /// attempts still in flight.
    pub async fn probe_imap(&self, account: &AccountRecord) -> Result<u64, ProbeError> {
        info!(uuid = %account.uuid, host = %account.imap.host, attempts = self.attempts, "Probing IMAP");

        let attempts = (0..self.attempts).map(|i| self.timed_imap_attempt(i, &account.imap));
        let latencies = try_join_all(attempts).await.map_err(|code| {
            warn!(uuid = %account.uuid, code = %code, "IMAP probe failed");
            ProbeError::Imap(code)
        })?;

        let total: u128 = latencies.iter().map(Duration::as_millis).sum();
        let average = (total as f64 / latencies.len() as f64).round() as u64;
        info!(uuid = %account.uuid, latency_ms = average, "IMAP probe passed");
        Ok(average)
    }

    async fn timed_imap_attempt(&self, index: usize, settings: &ServerSettings) -> Result<Duration, ErrorCode> {
        let started = Instant::now();
        match timeout(self.timeout, self.probe.imap_attempt(settings)).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                debug!(attempt = index, elapsed_ms = elapsed.as_millis() as u64, "IMAP attempt ok");
                Ok(elapsed)
            }
            Ok(Err(e)) => {
                debug!(attempt = index, error = %e, "IMAP attempt failed");
                Err(classify_error(&e))
            }
            Err(_) => Err(ErrorCode::Timeout),
        }
    }

    pub async fn probe_smtp(&self, account: &AccountRecord) -> Result<(), ProbeError> {
        info!(uuid = %account.uuid, host = %account.smtp.host, "Verifying SMTP");
        let result = match timeout(self.timeout, self.probe.smtp_verify(&account.smtp, self.timeout)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %e, "SMTP verify failed");
                Err(classify_error(&e))
            }
            Err(_) => Err(ErrorCode::Timeout),
        };
        result.map_err(|code| {
            warn!(uuid = %account.uuid, code = %code, "SMTP probe failed");
            ProbeError::Smtp(code)
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted probe: IMAP attempt `i` sleeps `imap[i].0` then returns
    /// `imap[i].1`
    pub struct ScriptedProbe {
        pub imap: Vec<(u64, Result<(), String>)>,
        pub smtp: Result<(), String>,
        pub next: AtomicUsize,
        pub smtp_calls: Mutex<usize>,
    }

    impl ScriptedProbe {
        pub fn new(imap: Vec<(u64, Result<(), String>)>, smtp: Result<(), String>) -> Self {
            Self {
                imap,
                smtp,
                next: AtomicUsize::new(0),
                smtp_calls: Mutex::new(0),
            }
        }

        pub fn passing() -> Self {
            Self::new(vec![(10, Ok(())); 4], Ok(()))
        }
    }

    #[async_trait]
    impl MailServerProbe for ScriptedProbe {
        async fn imap_attempt(&self, _settings: &ServerSettings) -> Result<(), String> {
            let i = self.next.fetch_add(1, Ordering::SeqCst) % self.imap.len();
            let (delay, result) = self.imap[i].clone();
            tokio::time::sleep(Duration::from_millis(delay)).await;
            result
        }

        async fn smtp_verify(&self, _settings: &ServerSettings, _timeout: Duration) -> Result<(), String> {
            *self.smtp_calls.lock().unwrap() += 1;
            self.smtp.clone()
        }
    }
}
