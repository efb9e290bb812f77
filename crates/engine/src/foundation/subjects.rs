//! System subject naming for the catch-up protocol
//!
//! Catch-up traffic flows over dedicated system subjects: a stable per-
//! stream sync inbox, a per-install reply inbox, and a per-sender ack
//! subject whose final token carries the acked payload size.

use rand::Rng;

const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const BASE: u64 = 62;
const TOKEN_LEN: usize = 8;

/// Number of tokens in an ack subject carrying a size suffix.
const ACK_SUBJECT_TOKENS: usize = 5;

/// Encode `value` into the fixed-length base-62 token alphabet.
pub(crate) fn encode_token(mut value: u64) -> String {
    let mut buf = [0u8; TOKEN_LEN];
    for b in buf.iter_mut() {
        *b = DIGITS[(value % BASE) as usize];
        value /= BASE;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn token() -> String {
    encode_token(rand::thread_rng().gen::<u64>() >> 1)
}

/// Stable per-stream inbox for catch-up requests.
pub fn sync_subject() -> String {
    format!("$SYS.JSC.SYNC.{}", token())
}

/// One-shot reply inbox for a catch-up install.
pub fn sync_reply_subject() -> String {
    format!("$SYS.JSC.R.{}", token())
}

/// Per-sender ack subject; subscribed with a trailing wildcard so each
/// ack can carry its payload size as the final token.
pub fn sync_ack_subject() -> String {
    format!("$SYS.JSC.ACK.{}.*", token())
}

/// Fill the ack subject's wildcard with a concrete payload size.
pub fn ack_reply_with_size(ack_subject: &str, size: usize) -> String {
    ack_subject.replacen(".*", &format!(".{size}"), 1)
}

/// Extract the payload size from an ack subject's final token. Returns
/// `None` when the subject does not have the expected shape.
pub fn parse_ack_size(subject: &str) -> Option<u64> {
    let tokens: Vec<&str> = subject.split('.').collect();
    if tokens.len() != ACK_SUBJECT_TOKENS {
        return None;
    }
    tokens[ACK_SUBJECT_TOKENS - 1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_have_fixed_length_tokens() {
        let sync = sync_subject();
        assert!(sync.starts_with("$SYS.JSC.SYNC."));
        assert_eq!(sync.len(), "$SYS.JSC.SYNC.".len() + TOKEN_LEN);

        let reply = sync_reply_subject();
        assert!(reply.starts_with("$SYS.JSC.R."));

        let ack = sync_ack_subject();
        assert!(ack.starts_with("$SYS.JSC.ACK."));
        assert!(ack.ends_with(".*"));
    }

    #[test]
    fn tokens_are_unique_enough() {
        let a = sync_subject();
        let b = sync_subject();
        assert_ne!(a, b);
    }

    #[test]
    fn ack_size_round_trip() {
        let ack = sync_ack_subject();
        let reply = ack_reply_with_size(&ack, 4096);
        assert!(reply.ends_with(".4096"));
        assert_eq!(parse_ack_size(&reply), Some(4096));
    }

    #[test]
    fn ack_size_rejects_malformed_subjects() {
        assert_eq!(parse_ack_size("$SYS.JSC.ACK.tok"), None);
        assert_eq!(parse_ack_size("$SYS.JSC.ACK.tok.notanumber"), None);
        assert_eq!(parse_ack_size("too.many.tokens.in.this.subject"), None);
    }
}
