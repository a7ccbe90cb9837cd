//! The token holder consumed by [`AccessTokenEvents`][crate::AccessTokenEvents]

use std::fmt;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use tokwatch_clock::UnixTime;

/// Writes at most `max_chars` characters of `token`, marking a cut with an ellipsis
fn write_prefix(token: &str, f: &mut fmt::Formatter, max_chars: usize) -> fmt::Result {
    if token.chars().count() <= max_chars {
        return f.write_str(token);
    }

    let kept: String = token.chars().take(max_chars.saturating_sub(1)).collect();
    f.write_str(&kept)?;
    f.write_str("…")
}

/// An access token
///
/// Only its presence matters when scheduling expiration events. The value is
/// redacted when formatted unless the alternate flag is used.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

const REDACTED: &str = "***ACCESS TOKEN***";

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            let max_chars = f.width().unwrap_or(15);
            write!(f, "\"")?;
            write_prefix(self.as_str(), f, max_chars)?;
            write!(f, "\"")
        } else {
            f.write_str(REDACTED)
        }
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (f.alternate(), f.width()) {
            (true, Some(max_chars)) => write_prefix(self.as_str(), f, max_chars),
            (true, None) => f.write_str(self.as_str()),
            (false, _) => f.write_str(REDACTED),
        }
    }
}

/// Something holding an access token with a known remaining lifetime
pub trait TokenContainer {
    /// The access token, if one is held
    fn access_token(&self) -> Option<&AccessTokenRef>;

    /// Seconds until the access token expires, if known
    ///
    /// May be zero or negative for a token that has already expired.
    fn expires_in(&self) -> Option<i64>;
}

/// A snapshot of an access token and its remaining lifetime
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// The access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,

    /// Seconds until the access token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

impl TokenState {
    /// Constructs a snapshot for a token with `expires_in` seconds remaining
    pub fn new(access_token: impl Into<AccessToken>, expires_in: i64) -> Self {
        Self {
            access_token: Some(access_token.into()),
            expires_in: Some(expires_in),
        }
    }

    /// Constructs a snapshot for a token expiring at an absolute time, as of `now`
    pub fn expiring_at(
        access_token: impl Into<AccessToken>,
        expires_at: UnixTime,
        now: UnixTime,
    ) -> Self {
        Self::new(access_token, seconds_between(now, expires_at))
    }
}

fn seconds_between(from: UnixTime, to: UnixTime) -> i64 {
    let span = if to >= from { to - from } else { from - to };
    let magnitude = i64::try_from(span.0).unwrap_or(i64::MAX);
    if to >= from {
        magnitude
    } else {
        -magnitude
    }
}

impl TokenContainer for TokenState {
    fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token.as_deref()
    }

    fn expires_in(&self) -> Option<i64> {
        self.expires_in
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn access_token_is_redacted() {
        let owned = AccessToken::from_static("eyJhbGciOiJIUzI1NiJ9.payload.signature");
        let token: &AccessTokenRef = &owned;

        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:#?}", token), "\"eyJhbGciOiJIUz…\"");
        assert_eq!(format!("{:#5}", token), "eyJh…");
        assert_eq!(format!("{:#}", token), owned.as_str());
    }

    #[test]
    fn short_access_token_is_revealed_whole() {
        let owned = AccessToken::from_static("abc");
        let token: &AccessTokenRef = &owned;

        assert_eq!(format!("{:#?}", token), "\"abc\"");
        assert_eq!(format!("{:#3}", token), "abc");
    }

    #[test]
    fn expiring_at_counts_down_from_now() {
        let state = TokenState::expiring_at(
            AccessToken::from_static("token"),
            UnixTime(1_300),
            UnixTime(1_000),
        );
        assert_eq!(state.expires_in(), Some(300));
    }

    #[test]
    fn expiring_at_in_the_past_is_negative() {
        let state = TokenState::expiring_at(
            AccessToken::from_static("token"),
            UnixTime(990),
            UnixTime(1_000),
        );
        assert_eq!(state.expires_in(), Some(-10));
    }

    #[test]
    fn deserializes_partial_state() -> Result<()> {
        let state: TokenState = serde_json::from_str(r#"{ "access_token": "abc" }"#)?;

        assert_eq!(state.access_token().map(|t| t.as_str()), Some("abc"));
        assert_eq!(state.expires_in(), None);
        Ok(())
    }
}
