//! App-only access tokens for Microsoft Graph.
//!
//! Tokens come from the OAuth2 client-credentials grant. They are kept in
//! memory for the life of the process and, when a cache key is configured,
//! in an AES-256-GCM encrypted file so restarts can reuse them.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::graph::redact_response_body;

pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
pub const TOKEN_CACHE_KEY_BYTES: usize = 32;

const CACHE_SKEW_SECONDS: i64 = 60;
const TOKEN_CACHE_NONCE_BYTES: usize = 12;
const TOKEN_CACHE_ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Where and how tokens are persisted between runs.
#[derive(Debug, Clone, Default)]
pub struct TokenCacheSettings {
    pub path: Option<PathBuf>,
    pub key: Option<[u8; TOKEN_CACHE_KEY_BYTES]>,
}

pub struct TokenProvider {
    client: Client,
    credentials: GraphCredentials,
    token_url: String,
    cache: TokenCacheSettings,
    current: Mutex<Option<CachedAccessToken>>,
}

impl TokenProvider {
    pub fn new(
        client: Client,
        credentials: GraphCredentials,
        token_url: String,
        cache: TokenCacheSettings,
    ) -> Self {
        Self {
            client,
            credentials,
            token_url,
            cache,
            current: Mutex::new(None),
        }
    }

    /// Returns a bearer token, fetching a fresh one when nothing cached is
    /// still valid. `force_refresh` discards every cached token first.
    pub async fn access_token(&self, force_refresh: bool) -> Result<String> {
        let mut current = self.current.lock().await;

        if force_refresh {
            *current = None;
            self.clear_disk_cache()?;
        }

        if let Some(token) = current.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.access_token.clone());
        }

        if !force_refresh {
            if let Some(token) = self.cached_on_disk()? {
                debug!("reusing graph token from disk cache");
                let access_token = token.access_token.clone();
                *current = Some(token);
                return Ok(access_token);
            }
        }

        let fresh = self.fetch_token().await?;
        self.store_on_disk(&fresh)?;
        let access_token = fresh.access_token.clone();
        *current = Some(fresh);
        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<CachedAccessToken> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .with_context(|| format!("request graph oauth token from {}", self.token_url))?;

        let status = response.status();
        let body = response.text().await.context("read graph token response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "graph oauth token request failed: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }

        let payload: OAuthTokenResponse =
            serde_json::from_str(&body).context("decode graph token JSON response")?;
        info!(expires_in = payload.expires_in, "graph token acquired");
        Ok(CachedAccessToken::from_response(payload, Utc::now()))
    }

    fn cached_on_disk(&self) -> Result<Option<CachedAccessToken>> {
        let Some(path) = &self.cache.path else {
            return Ok(None);
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("read token cache {}", path.display()))
            }
        };

        let Some(key) = &self.cache.key else {
            // Without a key nothing is kept at rest.
            self.clear_disk_cache()?;
            return Ok(None);
        };

        let token = match decrypt_cached_access_token(&raw, key) {
            Ok(token) => token,
            Err(error) => {
                warn!(error = %error, "discarding unreadable graph token cache");
                self.clear_disk_cache()?;
                return Ok(None);
            }
        };

        if token.is_expired() {
            self.clear_disk_cache()?;
            return Ok(None);
        }
        Ok(Some(token))
    }

    fn store_on_disk(&self, token: &CachedAccessToken) -> Result<()> {
        let (Some(path), Some(key)) = (&self.cache.path, &self.cache.key) else {
            return Ok(());
        };

        let value = encrypt_cached_access_token(token, key).context("encrypt cached graph token")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create token cache dir {}", parent.display()))?;
        }
        std::fs::write(path, value)
            .with_context(|| format!("write token cache {}", path.display()))
    }

    fn clear_disk_cache(&self) -> Result<()> {
        let Some(path) = &self.cache.path else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("remove token cache {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
    ext_expires_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CachedAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn from_response(payload: OAuthTokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: payload.access_token,
            expires_at: now
                + Duration::seconds((payload.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedTokenEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

fn encrypt_cached_access_token(
    token: &CachedAccessToken,
    encryption_key: &[u8; TOKEN_CACHE_KEY_BYTES],
) -> Result<String> {
    let mut plaintext = serde_json::to_vec(token).context("serialize token payload")?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, encryption_key)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let mut nonce_bytes = [0u8; TOKEN_CACHE_NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("generate random nonce for token cache encryption"))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut plaintext,
    )
    .map_err(|_| anyhow!("encrypt graph token cache"))?;

    let envelope = EncryptedTokenEnvelope {
        version: TOKEN_CACHE_ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&plaintext),
    };

    serde_json::to_string(&envelope).context("serialize encrypted token envelope")
}

fn decrypt_cached_access_token(
    raw: &str,
    encryption_key: &[u8; TOKEN_CACHE_KEY_BYTES],
) -> Result<CachedAccessToken> {
    let envelope: EncryptedTokenEnvelope =
        serde_json::from_str(raw).context("parse encrypted token envelope")?;

    if envelope.version != TOKEN_CACHE_ENVELOPE_VERSION {
        return Err(anyhow!(
            "unsupported token envelope version {}",
            envelope.version
        ));
    }

    let nonce_bytes: [u8; TOKEN_CACHE_NONCE_BYTES] = hex_decode(&envelope.nonce_hex)
        .context("decode envelope nonce")?
        .try_into()
        .map_err(|_| anyhow!("invalid nonce length in token envelope"))?;
    let mut ciphertext =
        hex_decode(&envelope.ciphertext_hex).context("decode envelope ciphertext")?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, encryption_key)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| anyhow!("decrypt graph token cache"))?;

    serde_json::from_slice(plaintext).context("parse decrypted token payload")
}

pub fn parse_token_cache_key_hex(raw: &str) -> Result<[u8; TOKEN_CACHE_KEY_BYTES]> {
    hex_decode(raw)
        .context("decode token cache key hex")?
        .try_into()
        .map_err(|_| anyhow!("token cache key must be 32 bytes"))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let value = raw.trim().as_bytes();
    if value.len() % 2 != 0 {
        return Err(anyhow!("hex string length must be even"));
    }

    value
        .chunks(2)
        .map(|pair| {
            let hi = decode_hex_nibble(pair[0]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            let lo = decode_hex_nibble(pair[1]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
