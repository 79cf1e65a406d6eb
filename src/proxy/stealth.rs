//! Anti-fingerprinting transport decorator.
//!
//! Wraps the plain [`HttpTransport`] with header defaulting, randomized
//! per-request user agents, randomized pacing between dispatches, lazy
//! SOCKS5 egress installation and transparent content-encoding negotiation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, USER_AGENT};
use hyper::{Request, Response};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec;
use crate::error::{Result, ShroudError};
use crate::proxy::transport::{Dialer, HttpTransport, Socks5Auth, Transport};

/// SOCKS5 egress configuration
#[derive(Debug, Clone)]
pub struct Socks5Config {
    /// Proxy address, `host:port`
    pub addr: String,
    pub auth: Option<Socks5Auth>,
}

/// Explicit stealth transport configuration.
///
/// Pacing applies only when both delays are non-zero. An empty user-agent
/// list disables the user-agent default entirely.
#[derive(Debug, Clone, Default)]
pub struct StealthConfig {
    pub user_agents: Vec<String>,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub socks5: Option<Socks5Config>,
    pub compression: bool,
}

/// Mutable dispatch state, the one shared-mutable piece of the system.
///
/// Guarded by a single async mutex so concurrent dispatches see a consistent
/// cadence and SOCKS5 initialization happens exactly once on success.
struct DispatchState {
    last_dispatch: Option<Instant>,
    socks5_initialized: bool,
}

/// Dispatch decorator adding anti-fingerprinting behavior around a plain
/// HTTP transport. Safe to share across concurrent requests; a shared
/// instance produces one shared artificial cadence across all its targets.
pub struct StealthTransport {
    underlying: HttpTransport,
    config: StealthConfig,
    state: Mutex<DispatchState>,
}

const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("accept-language", "de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7"),
    ("accept", "*/*"),
    ("connection", "keep-alive"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("dnt", "1"),
];

impl StealthTransport {
    pub fn new(config: StealthConfig) -> Self {
        Self::over(HttpTransport::new(), config)
    }

    /// Wrap a specific underlying transport (the default honors ambient
    /// proxy environment variables).
    pub fn over(underlying: HttpTransport, config: StealthConfig) -> Self {
        Self {
            underlying,
            config,
            state: Mutex::new(DispatchState {
                last_dispatch: None,
                socks5_initialized: false,
            }),
        }
    }

    /// Set canned headers on the request, never overwriting caller values.
    fn apply_default_headers(&self, req: &mut Request<Full<Bytes>>) {
        if !self.config.user_agents.is_empty() && !req.headers().contains_key(USER_AGENT) {
            let agent = {
                let mut rng = rand::thread_rng();
                &self.config.user_agents[rng.gen_range(0..self.config.user_agents.len())]
            };
            if let Ok(value) = HeaderValue::from_str(agent) {
                req.headers_mut().insert(USER_AGENT, value);
            }
        }

        for (name, value) in DEFAULT_HEADERS {
            let name = HeaderName::from_static(name);
            if !req.headers().contains_key(&name) {
                req.headers_mut()
                    .insert(name, HeaderValue::from_static(value));
            }
        }
    }

    /// Resolve and install the SOCKS5 dialer, at most once per instance.
    ///
    /// The initialized flag is only set on success, so a failed attempt is
    /// retried on the next dispatch.
    async fn ensure_socks5(&self, state: &mut DispatchState) -> Result<()> {
        let Some(socks5) = &self.config.socks5 else {
            return Ok(());
        };
        if state.socks5_initialized {
            return Ok(());
        }

        let addr = tokio::net::lookup_host(&socks5.addr)
            .await
            .map_err(|e| ShroudError::TransportInit(format!("{}: {}", socks5.addr, e)))?
            .next()
            .ok_or_else(|| {
                ShroudError::TransportInit(format!("{}: no addresses resolved", socks5.addr))
            })?;

        self.underlying.install_dialer(Dialer::Socks5 {
            addr,
            auth: socks5.auth.clone(),
        });
        state.socks5_initialized = true;
        debug!("SOCKS5 dialer installed for {}", socks5.addr);
        Ok(())
    }

    /// Sleep out the remainder of a randomized inter-dispatch delay.
    ///
    /// The last-dispatch timestamp is taken at dispatch begin, for every
    /// dispatch, whether or not a delay was applied.
    async fn pace(&self, state: &mut DispatchState) {
        let (min, max) = (self.config.min_delay, self.config.max_delay);
        if !min.is_zero() && !max.is_zero() {
            let want = if max > min {
                let mut rng = rand::thread_rng();
                rng.gen_range(min..max)
            } else {
                min
            };
            if let Some(last) = state.last_dispatch {
                let elapsed = last.elapsed();
                if elapsed < want {
                    tokio::time::sleep(want - elapsed).await;
                }
            }
        }
        state.last_dispatch = Some(Instant::now());
    }
}

#[async_trait]
impl Transport for StealthTransport {
    async fn round_trip(&self, mut req: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        self.apply_default_headers(&mut req);

        // When the caller negotiated its own encoding, stay out of the way
        // entirely: no advertisement, no decompression.
        let had_encoding = req.headers().contains_key(ACCEPT_ENCODING);
        if self.config.compression && !had_encoding {
            req.headers_mut()
                .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        }

        {
            let mut state = self.state.lock().await;
            self.ensure_socks5(&mut state).await?;
            self.pace(&mut state).await;
        }

        let mut res = self.underlying.round_trip(req).await?;

        if self.config.compression
            && !had_encoding
            && res.headers().contains_key(CONTENT_ENCODING)
        {
            codec::decompress_response(&mut res)?;
        }

        Ok(res)
    }
}
