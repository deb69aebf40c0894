//! Content-addressed hashing and record signatures.
//!
//! A tool's identity is the SHA-256 digest of a canonical form of its
//! `(code, test_case)` pair, so cosmetic whitespace differences do not
//! produce distinct artifacts. The signature binds a content hash to the
//! Gauntlet run that verified it.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Separator between the two canonicalized blobs inside the hash input.
const HASH_SEPARATOR: &str = "\n---TEST---\n";

/// Signature length in hex characters.
const SIGNATURE_LEN: usize = 32;

/// Canonicalize source text for hashing.
///
/// Line endings become `\n`, trailing whitespace is stripped per line, and
/// trailing blank lines are dropped. Stable across platforms.
pub fn canonicalize(source: &str) -> String {
    let normalized = source.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = normalized.split('\n').map(|l| l.trim_end()).collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

/// SHA-256 hex digest of the canonicalized `(code, test_case)` pair.
pub fn content_hash(code: &str, test_case: &str) -> String {
    let canonical = format!(
        "{}{}{}",
        canonicalize(code),
        HASH_SEPARATOR,
        canonicalize(test_case)
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Sign a verified record: digest over the content hash and the Gauntlet
/// run that approved it, truncated to 32 hex chars.
pub fn sign_record(content_hash: &str, gauntlet_run_id: &Uuid) -> String {
    let payload = format!("{content_hash}:{gauntlet_run_id}");
    let digest = hex::encode(Sha256::digest(payload.as_bytes()));
    digest[..SIGNATURE_LEN].to_string()
}

/// Check a record signature against its content hash and run id.
pub fn verify_signature(content_hash: &str, gauntlet_run_id: &Uuid, signature: &str) -> bool {
    sign_record(content_hash, gauntlet_run_id) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_normalizes_line_endings() {
        assert_eq!(canonicalize("a\r\nb\rc\n"), "a\nb\nc");
    }

    #[test]
    fn canonicalize_strips_trailing_whitespace_and_blanks() {
        assert_eq!(canonicalize("def f():  \n    return 1\t\n\n\n"), "def f():\n    return 1");
    }

    #[test]
    fn canonicalize_preserves_indentation() {
        let src = "def f():\n    if True:\n        return 1";
        assert_eq!(canonicalize(src), src);
    }

    #[test]
    fn hash_is_stable_across_cosmetic_differences() {
        let a = content_hash("def f(): return 1", "assert f() == 1");
        let b = content_hash("def f(): return 1  \r\n", "assert f() == 1\n\n");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_distinguishes_code_from_test_placement() {
        // Moving bytes across the code/test boundary must change the hash.
        let a = content_hash("x", "y");
        let b = content_hash("xy", "");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_sha256_hex() {
        let h = content_hash("code", "test");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_round_trip() {
        let run_id = Uuid::new_v4();
        let hash = content_hash("def f(): pass", "f()");
        let sig = sign_record(&hash, &run_id);
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify_signature(&hash, &run_id, &sig));
        assert!(!verify_signature(&hash, &Uuid::new_v4(), &sig));
    }
}
