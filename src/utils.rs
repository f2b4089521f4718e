use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use url::Url;

/// Character set accepted for application keys, tokens and channel names.
static VALID_INPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w\-:/.]*$").expect("valid identifier pattern"));

/// A URL is usable if it is non-empty and parses.
pub(crate) fn is_valid_url(input: &str) -> bool {
    !input.is_empty() && Url::parse(input).is_ok()
}

pub(crate) fn is_valid_input(input: &str) -> bool {
    VALID_INPUT.is_match(input)
}

/// An n-character base-62 token, used for connection nonces and outbound
/// message ids.
pub(crate) fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// The decimal segment of the socket path, `0..=999`.
pub(crate) fn random_broadcast_digits() -> u32 {
    rand::thread_rng().gen_range(0..1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https_urls() {
        assert!(is_valid_url("http://ortc-developers.realtime.co/server/2.1"));
        assert!(is_valid_url("https://node.example.com:8443/"));
        assert!(!is_valid_url(""));
        assert!(!is_valid_url("not a url"));
    }

    #[test]
    fn identifier_character_set() {
        assert!(is_valid_input("my_channel"));
        assert!(is_valid_input("yellow:*"));
        assert!(is_valid_input("a-b.c/d:e"));
        assert!(is_valid_input(""));
        assert!(!is_valid_input("has space"));
        assert!(!is_valid_input("semi;colon"));
    }

    #[test]
    fn random_ids_are_base62() {
        let id = random_id(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_id(16), random_id(16));
    }

    #[test]
    fn broadcast_digits_in_range() {
        for _ in 0..100 {
            assert!(random_broadcast_digits() < 1000);
        }
    }
}
