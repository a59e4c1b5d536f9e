//! Capability token generation and validation.

use rand::Rng;

use chunkferry_protocol::constants::TOKEN_LEN;

/// Generates a CSPRNG token as a lowercase hex string of [`TOKEN_LEN`] chars.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN / 2];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Returns `true` if `token` has the shape the handshake expects.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compares a received token with the configured one in constant time.
pub fn validate_token(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let diff = received
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_well_formed() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(is_well_formed(&token));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn validate_matching_and_mismatched() {
        let a = generate_token();
        let b = generate_token();
        assert!(validate_token(&a, &a));
        assert!(!validate_token(&a, &b));
        assert!(!validate_token("short", &a));
    }

    #[test]
    fn malformed_tokens() {
        assert!(!is_well_formed("xyz"));
        assert!(!is_well_formed(&"g".repeat(TOKEN_LEN)));
    }
}
