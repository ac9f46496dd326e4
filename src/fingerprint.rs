use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Stable query identity: literals stripped, whitespace collapsed, then
/// hashed. Two textually different executions of the same shape produce the
/// same fingerprint across restarts.

lazy_static! {
    static ref RE_SINGLE: Regex = Regex::new(r"'[^']*'").unwrap();
    static ref RE_DOUBLE: Regex = Regex::new(r#""[^"]*""#).unwrap();
    static ref RE_NUMBERS: Regex = Regex::new(r"\d+").unwrap();
}

/// Normalize a statement for identity purposes: replace literals with `?`,
/// lowercase, drop `$` and `;`, collapse whitespace.
pub fn normalize(query: &str) -> String {
    let mut result = RE_SINGLE.replace_all(query, "?").to_string();
    result = RE_DOUBLE.replace_all(&result, "?").to_string();
    result = RE_NUMBERS.replace_all(&result, "?").to_string();
    result = result.replace('$', "").replace(';', "");
    result = result.to_lowercase();
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 64-bit fingerprint of the normalized text: the first 8 bytes of its
/// SHA-256, big-endian.
pub fn fingerprint64(text: &str) -> u64 {
    let digest = Sha256::digest(normalize(text).as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Fingerprint over multiple identity-contributing parts, separated so that
/// `("ab", "c")` and `("a", "bc")` differ.
pub fn fingerprint_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(normalize(part).as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_literals_and_case() {
        assert_eq!(
            normalize("SELECT * FROM users WHERE id = 123 AND name = 'John';"),
            "select * from users where id = ? and name = ?"
        );
    }

    #[test]
    fn literal_changes_do_not_move_the_fingerprint() {
        let a = fingerprint64("SELECT * FROM t WHERE id = 1");
        let b = fingerprint64("SELECT * FROM t WHERE id = 29941");
        let c = fingerprint64("select * from t    where id = 'x'");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn shape_changes_move_the_fingerprint() {
        let a = fingerprint64("SELECT * FROM t WHERE id = 1");
        let b = fingerprint64("SELECT * FROM u WHERE id = 1");
        assert_ne!(a, b);
    }

    #[test]
    fn part_boundaries_matter() {
        let a = fingerprint_parts(["ab", "c"]);
        let b = fingerprint_parts(["a", "bc"]);
        assert_ne!(a, b);
    }

    proptest::proptest! {
        #[test]
        fn normalization_is_idempotent(query in ".{0,200}") {
            let once = normalize(&query);
            proptest::prop_assert_eq!(normalize(&once), once.clone());
        }

        #[test]
        fn integer_literal_value_never_moves_the_fingerprint(id in 0u64..1_000_000) {
            let a = fingerprint64(&format!("SELECT * FROM t WHERE id = {id}"));
            let b = fingerprint64("SELECT * FROM t WHERE id = 0");
            proptest::prop_assert_eq!(a, b);
        }
    }
}
