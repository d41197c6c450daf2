use std::{convert::TryFrom, ops::Range, time::Duration};

use aliri_base64::Base64Url;
use credstream_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{policy::RefreshConfig, AccessToken, AccessTokenRef};

/// Claims consulted, in order, for the username half of a credential pair
pub(crate) const USERNAME_CLAIMS: &[&str] = &["oid", "sub"];

/// A token issued by an identity provider along with its validity window
///
/// Tokens are immutable once constructed, and always satisfy
/// `expires_at > issued_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawToken")]
pub struct Token {
    value: AccessToken,
    issued_at: UnixTime,
    expires_at: UnixTime,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    raw_claims: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawToken {
    value: AccessToken,
    issued_at: UnixTime,
    expires_at: UnixTime,
    #[serde(default)]
    raw_claims: Map<String, Value>,
}

impl TryFrom<RawToken> for Token {
    type Error = TokenError;

    fn try_from(raw: RawToken) -> Result<Self, Self::Error> {
        Ok(Token::new(raw.value, raw.issued_at, raw.expires_at)?.with_claims(raw.raw_claims))
    }
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not yet due for refresh
    Fresh,
    /// The token is valid, but should be refreshed
    Due,
    /// The token is no longer valid
    Expired,
}

/// An error constructing a token
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token expires at or before the time it was issued
    #[error("token expiry ({expires_at}ms) must be after its issue time ({issued_at}ms)")]
    InvalidLifetime {
        /// When the token claims to have been issued
        issued_at: u64,
        /// When the token claims to expire
        expires_at: u64,
    },
    /// The token does not have the three segments of a JWT
    #[error("token is not a well-formed JWT")]
    MalformedJwt,
    /// The JWT payload segment is not valid base64url
    #[error("JWT payload is not valid base64url")]
    PayloadEncoding(#[source] aliri_base64::InvalidBase64Data),
    /// The JWT payload is not a JSON object
    #[error("JWT payload is not a JSON object")]
    PayloadJson(#[source] serde_json::Error),
    /// A claim required to build the token is missing or not a number
    #[error("JWT is missing the numeric `{0}` claim")]
    MissingClaim(&'static str),
}

macro_rules! expect_three {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next(), i.next()) {
            (Some(first), Some(second), Some(third), None) => Some((first, second, third)),
            _ => None,
        }
    }};
}

impl Token {
    /// Constructs a new token valid from `issued_at` until `expires_at`
    pub fn new(
        value: impl Into<AccessToken>,
        issued_at: UnixTime,
        expires_at: UnixTime,
    ) -> Result<Self, TokenError> {
        if expires_at <= issued_at {
            return Err(TokenError::InvalidLifetime {
                issued_at: issued_at.0,
                expires_at: expires_at.0,
            });
        }

        Ok(Self {
            value: value.into(),
            issued_at,
            expires_at,
            raw_claims: Map::new(),
        })
    }

    /// Constructs a token issued now that remains valid for `lifetime`
    pub fn with_lifetime(value: impl Into<AccessToken>, lifetime: Duration) -> Result<Self, TokenError> {
        Self::with_lifetime_and_clock(value, lifetime, &System)
    }

    /// Constructs a token issued at the clock's current time that remains valid for `lifetime`
    pub fn with_lifetime_and_clock<C: Clock>(
        value: impl Into<AccessToken>,
        lifetime: Duration,
        clock: &C,
    ) -> Result<Self, TokenError> {
        let issued_at = clock.now();
        Self::new(value, issued_at, issued_at + lifetime)
    }

    /// Attaches the raw claims carried by the token
    pub fn with_claims(mut self, claims: Map<String, Value>) -> Self {
        self.raw_claims = claims;
        self
    }

    /// Builds a token from a JWT access token
    ///
    /// The payload is decoded, but the signature is **not** verified. The
    /// validity window is taken from the `iat` and `exp` claims; if `iat` is
    /// absent, the token is considered issued now.
    pub fn from_jwt(value: impl Into<AccessToken>) -> Result<Self, TokenError> {
        Self::from_jwt_with_clock(value, &System)
    }

    /// Builds a token from a JWT access token, using the provided clock when
    /// the token does not carry an `iat` claim
    pub fn from_jwt_with_clock<C: Clock>(
        value: impl Into<AccessToken>,
        clock: &C,
    ) -> Result<Self, TokenError> {
        let value = value.into();
        let claims = decode_claims(&value)?;

        let expires_at = numeric_claim(&claims, "exp")
            .map(UnixTime::from_secs)
            .ok_or(TokenError::MissingClaim("exp"))?;
        let issued_at = numeric_claim(&claims, "iat")
            .map(UnixTime::from_secs)
            .unwrap_or_else(|| clock.now());

        Ok(Self::new(value, issued_at, expires_at)?.with_claims(claims))
    }

    /// Gets the opaque token value
    #[inline]
    pub fn value(&self) -> &AccessTokenRef {
        &self.value
    }

    /// Gets the time that the token was issued
    #[inline]
    pub fn issued_at(&self) -> UnixTime {
        self.issued_at
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Gets the token's total lifetime
    #[inline]
    pub fn lifetime(&self) -> Duration {
        self.expires_at - self.issued_at
    }

    /// Gets the interval during which the token is valid
    #[inline]
    pub fn valid_interval(&self) -> Range<UnixTime> {
        self.issued_at..self.expires_at
    }

    /// Gets the raw claims carried by the token
    #[inline]
    pub fn raw_claims(&self) -> &Map<String, Value> {
        &self.raw_claims
    }

    /// Gets a single raw claim
    #[inline]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.raw_claims.get(name)
    }

    /// The claim that identifies the principal, if the token carries one
    pub fn principal(&self) -> Option<&str> {
        USERNAME_CLAIMS
            .iter()
            .find_map(|name| self.claim(name).and_then(Value::as_str))
    }

    /// Whether the token has expired as of the provided time
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        time >= self.expires_at
    }

    /// Whether the token has expired according to the system clock
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(System.now())
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> Duration {
        self.expires_at - time
    }

    /// Gets the token's lifecycle status as of the provided time
    pub fn token_status_at(&self, time: UnixTime, config: &RefreshConfig) -> TokenStatus {
        if self.is_expired_at(time) {
            TokenStatus::Expired
        } else if time >= config.refresh_deadline(self) {
            TokenStatus::Due
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets the token's lifecycle status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, clock: &C, config: &RefreshConfig) -> TokenStatus {
        self.token_status_at(clock.now(), config)
    }
}

fn decode_claims(value: &AccessTokenRef) -> Result<Map<String, Value>, TokenError> {
    let (_, payload, _) = expect_three!(value.as_str().split('.')).ok_or(TokenError::MalformedJwt)?;
    let raw = Base64Url::from_encoded(payload).map_err(TokenError::PayloadEncoding)?;
    serde_json::from_slice(raw.as_slice()).map_err(TokenError::PayloadJson)
}

fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Option<u64> {
    let value = claims.get(name)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

#[cfg(test)]
pub(crate) mod test_util {
    use aliri_base64::Base64Url;
    use serde_json::Value;

    /// Builds an unsigned JWT carrying the given claims
    pub fn unsigned_jwt(claims: &Value) -> String {
        let header = Base64Url::from_raw(&br#"{"alg":"none","typ":"JWT"}"#[..]);
        let payload = Base64Url::from_raw(serde_json::to_vec(claims).unwrap());
        format!("{}.{}.", header, payload)
    }
}
