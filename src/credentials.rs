//! Runtime token decoding and environment discovery.
//!
//! The runner hands jobs a JWT whose `ac` claim is a JSON-encoded list of
//! cache scopes. The token is forwarded as an opaque bearer credential; its
//! signature is never checked here.

use std::{env, fmt};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{CacheError, Result};

pub const RUNTIME_TOKEN_ENV: &str = "ACTIONS_RUNTIME_TOKEN";
pub const CACHE_URL_ENV: &str = "ACTIONS_CACHE_URL";

/// Bitmask of access rights granted for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const READ: Permission = Permission(1);
    pub const WRITE: Permission = Permission(1 << 1);

    pub const fn from_bits(bits: u32) -> Self {
        Permission(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl std::ops::BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permission(self.0 | rhs.0)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > (Self::READ | Self::WRITE).0 {
            return write!(f, "{}", self.0);
        }
        let mut names = Vec::with_capacity(2);
        if self.can_read() {
            names.push("Read");
        }
        if self.can_write() {
            names.push("Write");
        }
        f.write_str(&names.join("|"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "Scope")]
    pub scope: String,
    #[serde(rename = "Permission")]
    pub permission: Permission,
}

/// Bearer token, its decoded scopes and the cache service endpoint.
#[derive(Clone)]
pub struct Credentials {
    token: String,
    scopes: Vec<Scope>,
    url: Url,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("scopes", &self.scopes)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Claims {
    ac: Option<String>,
}

impl Credentials {
    pub fn parse(token: &str, url: &str) -> Result<Self> {
        let scopes = decode_scopes(token)?;
        debug!(?scopes, "parsed runtime token");
        Ok(Self {
            token: token.to_string(),
            scopes,
            url: normalize_base_url(url)?,
        })
    }

    /// Builds credentials without decoding the token.
    pub fn new(token: impl Into<String>, scopes: Vec<Scope>, url: &str) -> Result<Self> {
        Ok(Self {
            token: token.into(),
            scopes,
            url: normalize_base_url(url)?,
        })
    }

    /// Reads the runner environment. Returns `None` outside a job that has
    /// cache access.
    pub fn from_env() -> Result<Option<Self>> {
        let (Ok(token), Ok(url)) = (env::var(RUNTIME_TOKEN_ENV), env::var(CACHE_URL_ENV)) else {
            return Ok(None);
        };
        Self::parse(&token, &url).map(Some)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn decode_scopes(token: &str) -> Result<Vec<Scope>> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CacheError::MalformedCredential(
            "token is not a three part JWT".to_string(),
        ));
    };
    let payload = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CacheError::MalformedCredential(format!("invalid token payload: {e}")))?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| CacheError::MalformedCredential(format!("invalid token claims: {e}")))?;
    let ac = claims.ac.ok_or_else(|| {
        CacheError::MalformedCredential("token has no access controls".to_string())
    })?;
    serde_json::from_str(&ac).map_err(|e| {
        CacheError::MalformedCredential(format!("failed to parse token access controls: {e}"))
    })
}

fn normalize_base_url(url: &str) -> Result<Url> {
    if url.ends_with('/') {
        Ok(Url::parse(url)?)
    } else {
        Ok(Url::parse(&format!("{url}/"))?)
    }
}
