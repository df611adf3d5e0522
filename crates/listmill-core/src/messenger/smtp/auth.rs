//! Client-side SMTP authentication encodings
//!
//! PLAIN and LOGIN are base64 encodings per RFC 4616 / the de-facto LOGIN
//! exchange; CRAM-MD5 answers the server challenge with an HMAC-MD5 digest
//! per RFC 2195.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

/// AUTH PLAIN initial response: base64(\0username\0password)
pub(crate) fn plain_response(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password))
}

/// One base64-encoded line of the LOGIN exchange
pub(crate) fn login_response(value: &str) -> String {
    BASE64.encode(value)
}

/// CRAM-MD5 response to a decoded server challenge:
/// base64("username hex(hmac-md5(password, challenge))")
pub(crate) fn cram_md5_response(username: &str, password: &str, challenge: &[u8]) -> String {
    let mut mac = HmacMd5::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(challenge);
    let digest = hex::encode(mac.finalize().into_bytes());
    BASE64.encode(format!("{} {}", username, digest))
}

/// Decode a base64 server challenge (the text after "334 ")
pub(crate) fn decode_challenge(encoded: &str) -> Option<Vec<u8>> {
    BASE64.decode(encoded.trim()).ok()
}
