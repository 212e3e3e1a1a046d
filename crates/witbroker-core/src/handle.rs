//! Opaque query handle tokens.
//!
//! A handle is `qh_` followed by 32 hex characters drawn from a random
//! source. It carries no work item data, so a caller cannot derive or
//! tamper its way to identifiers that were never returned by a query.

use rand::RngCore;
use std::fmt::Write as _;

/// Prefix shared by every handle the store issues.
pub const HANDLE_PREFIX: &str = "qh_";

const TOKEN_BYTES: usize = 16;

/// Generate a fresh handle token.
#[must_use]
pub fn generate() -> String {
    generate_with(&mut rand::thread_rng())
}

/// Generate a handle from a caller-supplied RNG.
pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill_bytes(&mut bytes);

    let mut out = String::with_capacity(HANDLE_PREFIX.len() + TOKEN_BYTES * 2);
    out.push_str(HANDLE_PREFIX);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Cheap shape check used before a lookup; it says nothing about whether the
/// handle was ever issued.
#[must_use]
pub fn looks_like_handle(candidate: &str) -> bool {
    candidate
        .strip_prefix(HANDLE_PREFIX)
        .is_some_and(|rest| {
            rest.len() == TOKEN_BYTES * 2 && rest.bytes().all(|b| b.is_ascii_hexdigit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn handles_have_stable_shape() {
        let handle = generate();
        assert!(handle.starts_with(HANDLE_PREFIX));
        assert_eq!(handle.len(), HANDLE_PREFIX.len() + 32);
        assert!(looks_like_handle(&handle));
    }

    #[test]
    fn handles_are_not_sequential() {
        let mut rng = StdRng::seed_from_u64(7);
        let handles: HashSet<String> = (0..1_000).map(|_| generate_with(&mut rng)).collect();
        assert_eq!(handles.len(), 1_000);
    }

    #[test]
    fn shape_check_rejects_ids_and_garbage() {
        assert!(!looks_like_handle("12345"));
        assert!(!looks_like_handle("qh_"));
        assert!(!looks_like_handle("qh_zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"));
        assert!(!looks_like_handle("wi_0123456789abcdef0123456789abcdef"));
    }
}
