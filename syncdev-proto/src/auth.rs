//! Message authentication and pairing material
//!
//! Frames on a paired connection carry an HMAC-SHA256 tag over
//! `type:timestamp:payload-bytes`, keyed by the peers' shared secret.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::Sha256;

use crate::messages::Message;

type HmacSha256 = Hmac<Sha256>;

fn message_mac(secret: &str, msg: &Message) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(msg.msg_type.wire_name().as_bytes());
    mac.update(b":");
    mac.update(msg.timestamp.to_string().as_bytes());
    mac.update(b":");
    mac.update(msg.payload_bytes());
    mac
}

/// Compute the hex HMAC tag for a message under the given shared secret.
pub fn sign_message(secret: &str, msg: &Message) -> String {
    hex::encode(message_mac(secret, msg).finalize().into_bytes())
}

/// Verify a message's `hmac` field. Comparison is constant-time.
pub fn verify_message(secret: &str, msg: &Message) -> bool {
    let Ok(tag) = hex::decode(&msg.hmac) else {
        return false;
    };
    message_mac(secret, msg).verify_slice(&tag).is_ok()
}

/// Generate a fresh 32-byte shared secret, base64-encoded for transport.
pub fn generate_shared_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}

/// Generate a 6-digit decimal pairing code, uniform over [0, 10^6).
pub fn generate_pairing_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageType, SyncRequest};

    fn sample_message() -> Message {
        Message::new(
            MessageType::SyncRequest,
            &SyncRequest {
                folder_pair_id: "pair-1".to_string(),
                local_path: "/tmp/a".to_string(),
                remote_path: "/tmp/b".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let mut msg = sample_message();
        msg.hmac = sign_message("secret-key", &msg);
        assert!(verify_message("secret-key", &msg));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut msg = sample_message();
        msg.hmac = sign_message("secret-key", &msg);
        assert!(!verify_message("other-key", &msg));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let mut msg = sample_message();
        msg.hmac = sign_message("secret-key", &msg);

        let altered = Message::new(
            MessageType::SyncRequest,
            &SyncRequest {
                folder_pair_id: "pair-2".to_string(),
                local_path: "/tmp/a".to_string(),
                remote_path: "/tmp/b".to_string(),
            },
        )
        .unwrap();
        msg.payload = altered.payload;
        assert!(!verify_message("secret-key", &msg));
    }

    #[test]
    fn test_flipped_tag_bit_fails() {
        let mut msg = sample_message();
        msg.hmac = sign_message("secret-key", &msg);

        // Flip one hex nibble of the tag
        let mut tag: Vec<u8> = msg.hmac.into_bytes();
        tag[0] = if tag[0] == b'0' { b'1' } else { b'0' };
        msg.hmac = String::from_utf8(tag).unwrap();
        assert!(!verify_message("secret-key", &msg));
    }

    #[test]
    fn test_non_hex_tag_fails() {
        let mut msg = sample_message();
        msg.hmac = "not hex at all".to_string();
        assert!(!verify_message("secret-key", &msg));
    }

    #[test]
    fn test_survives_wire_roundtrip() {
        let mut msg = sample_message();
        msg.hmac = sign_message("secret-key", &msg);

        let frame = msg.encode().unwrap();
        let decoded = Message::decode(&frame).unwrap();
        assert!(verify_message("secret-key", &decoded));
    }

    #[test]
    fn test_shared_secret_is_32_bytes() {
        let secret = generate_shared_secret();
        let bytes = BASE64_STANDARD.decode(&secret).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_ne!(secret, generate_shared_secret());
    }

    #[test]
    fn test_pairing_code_format() {
        for _ in 0..100 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
