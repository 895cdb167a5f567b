/*!
Crypto things
*/

/// HMAC-sign `s` with the configured session signing key.
///
/// Session cookies carry the raw id; the server-side store is keyed by
/// this signature, so a dump of the store alone can't be replayed as
/// cookies.
pub fn hmac_sign(s: &str) -> String {
    // using a 32 byte key
    let s_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, crate::CONFIG.session_key.as_bytes());
    let tag = ring::hmac::sign(&s_key, s.as_bytes());
    hex::encode(&tag)
}
