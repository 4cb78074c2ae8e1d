use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rsip::headers::ToTypedHeader;
use rsip::headers::auth::{self, AuthQop, Qop};
use rsip::{Header, Request};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ProxyAuthConfig;
use crate::error::{Error, Result};

use super::utils::{constant_time_eq, md5_hex, unix_nanos};

const NONCE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub enum AuthDecision {
    Authorized,
    /// 407 is to be sent with this Proxy-Authenticate header.
    Challenge(Header),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &Request) -> AuthDecision;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _request: &Request) -> AuthDecision {
        AuthDecision::Authorized
    }
}

#[derive(Debug)]
struct NonceStore {
    counter: AtomicU64,
    nonces: Mutex<HashMap<String, Instant>>,
}

impl NonceStore {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    async fn issue(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let raw = format!("{}:{}:{}", seq, unix_nanos(), std::process::id());
        let nonce = md5_hex(raw.as_bytes());
        let mut guard = self.nonces.lock().await;
        guard.retain(|_, issued| issued.elapsed() < NONCE_TTL);
        guard.insert(nonce.clone(), Instant::now());
        nonce
    }

    async fn is_valid(&self, nonce: &str) -> bool {
        let mut guard = self.nonces.lock().await;
        guard.retain(|_, issued| issued.elapsed() < NONCE_TTL);
        guard.contains_key(nonce)
    }

    async fn invalidate(&self, nonce: &str) {
        self.nonces.lock().await.remove(nonce);
    }
}

/// MD5 digest authentication against a static credential list, using
/// Proxy-Authorization / 407.
#[derive(Debug)]
pub struct DigestAuthenticator {
    config: ProxyAuthConfig,
    nonces: NonceStore,
}

impl DigestAuthenticator {
    pub fn new(config: ProxyAuthConfig) -> Self {
        Self {
            config,
            nonces: NonceStore::new(),
        }
    }

    async fn challenge(&self, stale: bool) -> AuthDecision {
        let nonce = self.nonces.issue().await;
        let challenge = rsip::typed::ProxyAuthenticate(rsip::typed::WwwAuthenticate {
            scheme: auth::Scheme::Digest,
            realm: self.config.realm.clone(),
            domain: None,
            nonce,
            opaque: None,
            stale: stale.then(|| "true".into()),
            algorithm: Some(auth::Algorithm::Md5),
            qop: Some(Qop::Auth),
            charset: None,
        });
        AuthDecision::Challenge(Header::ProxyAuthenticate(challenge.into()))
    }

    fn password_for(&self, username: &str) -> Option<&str> {
        self.config
            .credentials
            .iter()
            .find(|credential| credential.username == username)
            .map(|credential| credential.password.as_str())
    }
}

#[async_trait]
impl Authenticator for DigestAuthenticator {
    async fn authenticate(&self, request: &Request) -> AuthDecision {
        let header = request.headers.iter().find_map(|header| match header {
            Header::ProxyAuthorization(value) => Some(value.clone()),
            _ => None,
        });
        let Some(header) = header else {
            debug!(realm = %self.config.realm, "no Proxy-Authorization, issuing challenge");
            return self.challenge(false).await;
        };
        let authorization = match header.typed() {
            Ok(typed) => typed.0,
            Err(err) => {
                warn!(error = %err, "unparsable Proxy-Authorization");
                return self.challenge(false).await;
            }
        };

        if authorization.scheme != auth::Scheme::Digest || authorization.realm != self.config.realm
        {
            warn!(realm = %authorization.realm, scheme = ?authorization.scheme, "digest realm or scheme mismatch");
            return self.challenge(false).await;
        }
        let Some(password) = self.password_for(&authorization.username) else {
            warn!(username = %authorization.username, "unknown digest user");
            return self.challenge(false).await;
        };
        if !self.nonces.is_valid(&authorization.nonce).await {
            warn!(nonce = %authorization.nonce, "nonce invalid or expired");
            return self.challenge(true).await;
        }

        let expected = match digest_response(&authorization, request, password, &self.config.realm)
        {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to compute digest response");
                self.nonces.invalidate(&authorization.nonce).await;
                return self.challenge(true).await;
            }
        };
        let provided = authorization.response.to_ascii_lowercase();
        self.nonces.invalidate(&authorization.nonce).await;
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            warn!(username = %authorization.username, "digest response mismatch");
            return self.challenge(true).await;
        }
        AuthDecision::Authorized
    }
}

pub(crate) fn digest_response(
    authorization: &rsip::typed::Authorization,
    request: &Request,
    password: &str,
    realm: &str,
) -> Result<String> {
    if let Some(algorithm) = authorization.algorithm
        && algorithm != auth::Algorithm::Md5
    {
        return Err(Error::configuration("unsupported digest algorithm"));
    }

    let ha1 = md5_hex(format!("{}:{}:{}", authorization.username, realm, password).as_bytes());
    let ha2 = md5_hex(format!("{}:{}", request.method, authorization.uri).as_bytes());

    match &authorization.qop {
        Some(AuthQop::Auth { cnonce, nc }) => Ok(md5_hex(
            format!(
                "{}:{}:{:08x}:{}:auth:{}",
                ha1, authorization.nonce, nc, cnonce, ha2
            )
            .as_bytes(),
        )),
        Some(AuthQop::AuthInt { .. }) => Err(Error::configuration("qop auth-int not supported")),
        None => Ok(md5_hex(
            format!("{}:{}:{}", ha1, authorization.nonce, ha2).as_bytes(),
        )),
    }
}
