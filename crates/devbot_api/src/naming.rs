//! Object naming helpers.

use rand::Rng;

/// Length of the random suffixes used for generated object names.
pub const HASH_LENGTH: usize = 7;

const HEX: &[u8] = b"0123456789abcdef";

/// Random lowercase hex string of `len` characters.
pub fn random_hash(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Random name for a generated child object, e.g. `a3f09c1`.
pub fn generate_name() -> String {
    random_hash(HASH_LENGTH)
}

/// Lowercases `value` and replaces every run of non-alphanumeric characters
/// with a single `-`. `feature/Login_v2` becomes `feature-login-v2`.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// RFC 1123 label: at most 63 characters of `[a-z0-9-]`, alphanumeric at
/// both ends.
pub fn is_dns1123_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| edge_ok(b) || b == b'-')
}

/// RFC 1123 subdomain: dot-separated labels, at most 253 characters.
pub fn is_dns1123_subdomain(value: &str) -> bool {
    !value.is_empty() && value.len() <= 253 && value.split('.').all(is_dns1123_label)
}
