//! Double-submit CSRF pair.
//!
//! The secret lives in an HTTP-only cookie the page cannot read; the derived
//! token is handed to the client and echoed back on mutating requests.
//! Verification recomputes the token from the secret, so no server-side
//! state is kept.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// CSRF pair lifetime, independent of authentication state.
pub const CSRF_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct CsrfPair {
    pub secret: String,
    pub token: String,
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::rng();
    let mut buf = vec![0u8; bytes];
    rng.fill(buf.as_mut_slice());
    hex::encode(buf)
}

fn derive(secret: &str, salt: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(salt.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Generate a fresh secret and its derived token.
pub fn issue() -> CsrfPair {
    let secret = random_hex(24);
    let salt = random_hex(8);
    // new_from_slice accepts any key length for HMAC; the unwrap cannot fire.
    let mac = derive(&secret, &salt).expect("HMAC accepts any key length");
    CsrfPair {
        token: format!("{salt}.{mac}"),
        secret,
    }
}

/// Verify a client-echoed token against the cookie-held secret.
/// Comparison is constant-time.
pub fn verify(secret: &str, token: &str) -> bool {
    let Some((salt, mac_hex)) = token.split_once('.') else {
        return false;
    };
    let Ok(expected) = hex::decode(mac_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(salt.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
