//! Group tokens.
//!
//! A group token is a time-based one-time code (RFC 6238, HMAC-SHA1, six digits) keyed by the
//! group's secret and id. The raw secret is also accepted, as an operator override.

use atc_common::unix_secs;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::{
    config::{AtcdOptions, DEFAULT_OTP_TIMEOUT},
    store::Group,
};

const SECRET_LEN: usize = 32;
const DIGITS: u32 = 6;

/// Generates a fresh group secret from the thread-local CSPRNG.
pub fn generate_secret() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(SECRET_LEN).map(char::from).collect()
}

/// Derives and verifies group tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authenticator {
    secure: bool,
    /// Length of a code's validity window, in seconds.
    period: u64,
}

impl Authenticator {
    /// Creates an authenticator. A zero `otp_timeout` selects [`DEFAULT_OTP_TIMEOUT`].
    pub fn new(options: &AtcdOptions) -> Self {
        let period = match options.otp_timeout {
            0 => DEFAULT_OTP_TIMEOUT,
            seconds => seconds,
        };
        Self { secure: options.secure, period: u64::from(period) }
    }

    /// Whether tokens are checked at all.
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// The current token of `group`. Empty when running insecure.
    pub fn token(&self, group: &Group) -> String {
        self.token_at(group, unix_secs())
    }

    /// The token of `group` in the window containing `unix_secs`.
    pub fn token_at(&self, group: &Group, unix_secs: u64) -> String {
        if !self.secure {
            return String::new();
        }

        totp(&key(group), unix_secs / self.period)
    }

    /// Whether `token` grants access to `group` right now.
    pub fn verify(&self, group: &Group, token: &str) -> bool {
        self.verify_at(group, token, unix_secs())
    }

    /// Whether `token` grants access to `group` at `unix_secs`. The raw secret always does.
    pub fn verify_at(&self, group: &Group, token: &str, unix_secs: u64) -> bool {
        if !self.secure {
            return true;
        }

        let is_secret = bool::from(token.as_bytes().ct_eq(group.secret.as_bytes()));
        let code = totp(&key(group), unix_secs / self.period);
        is_secret || bool::from(token.as_bytes().ct_eq(code.as_bytes()))
    }
}

fn key(group: &Group) -> Vec<u8> {
    format!("{}::{}", group.secret, group.id).into_bytes()
}

/// HOTP value of `counter` (RFC 4226), truncated to [`DIGITS`] digits.
fn totp(key: &[u8], counter: u64) -> String {
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(key) else {
        unreachable!("hmac accepts keys of any length")
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    format!("{:0width$}", binary % 10u32.pow(DIGITS), width = DIGITS as usize)
}
