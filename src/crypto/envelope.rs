//! Encrypted frame envelope.
//!
//! Sensitive control messages cross the wire as
//! `{"type":"ENCRYPTED_MESSAGE","iv":..,"tag":..,"payload":..}` with all
//! three fields base64. The plaintext is the JSON encoding of the inner
//! control message; an envelope may not nest another envelope.

use crate::crypto::session::{SealedFrame, SessionCrypto, GCM_IV_LEN, GCM_TAG_LEN};
use crate::error::{Error, Result};
use crate::network::protocol::ControlMessage;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Seal a control message into an `ENCRYPTED_MESSAGE` envelope frame.
pub fn encrypt_control(crypto: &SessionCrypto, msg: &ControlMessage) -> Result<ControlMessage> {
    if matches!(msg, ControlMessage::Encrypted { .. }) {
        return Err(Error::Policy("refusing to nest encrypted envelopes".to_string()));
    }

    let plaintext = serde_json::to_vec(msg)?;
    let sealed = crypto.seal(&plaintext)?;

    Ok(ControlMessage::Encrypted {
        iv: BASE64.encode(sealed.iv),
        tag: BASE64.encode(sealed.tag),
        payload: BASE64.encode(&sealed.ciphertext),
    })
}

/// Open an `ENCRYPTED_MESSAGE` envelope and parse the inner control message.
pub fn decrypt_control(
    crypto: &SessionCrypto,
    iv: &str,
    tag: &str,
    payload: &str,
) -> Result<ControlMessage> {
    let iv = decode_fixed::<GCM_IV_LEN>(iv, "iv")?;
    let tag = decode_fixed::<GCM_TAG_LEN>(tag, "tag")?;
    let ciphertext = BASE64
        .decode(payload)
        .map_err(|e| Error::Decryption(format!("invalid payload encoding: {}", e)))?;

    let plaintext = crypto.open(&SealedFrame {
        iv,
        tag,
        ciphertext,
    })?;

    let inner: ControlMessage = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::Decryption(format!("invalid plaintext frame: {}", e)))?;

    if matches!(inner, ControlMessage::Encrypted { .. }) {
        return Err(Error::Policy("nested encrypted envelope".to_string()));
    }

    Ok(inner)
}

fn decode_fixed<const N: usize>(encoded: &str, field: &str) -> Result<[u8; N]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::Decryption(format!("invalid {} encoding: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Decryption(format!("invalid {} length", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::handshake::Keypair;
    use crate::network::protocol::MessageBody;

    fn session_pair() -> (SessionCrypto, SessionCrypto) {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let a_spki = a.public_spki();
        let b_spki = b.public_spki();
        let ka = a.agree(&b_spki).unwrap();
        let kb = b.agree(&a_spki).unwrap();
        (SessionCrypto::new(ka), SessionCrypto::new(kb))
    }

    fn chat(text: &str) -> ControlMessage {
        ControlMessage::Message {
            from: "a111".into(),
            id: "m-1".into(),
            ts: 7,
            body: MessageBody::Text { text: text.into() },
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let (tx, rx) = session_pair();
        let msg = chat("hello");

        let envelope = encrypt_control(&tx, &msg).unwrap();
        let (iv, tag, payload) = match &envelope {
            ControlMessage::Encrypted { iv, tag, payload } => (iv, tag, payload),
            other => panic!("expected envelope, got {:?}", other),
        };

        let inner = decrypt_control(&rx, iv, tag, payload).unwrap();
        assert_eq!(inner, msg);
    }

    #[test]
    fn test_envelope_hides_plaintext() {
        let (tx, _) = session_pair();
        let envelope = encrypt_control(&tx, &chat("top secret contents")).unwrap();
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(wire.contains(r#""type":"ENCRYPTED_MESSAGE""#));
        assert!(!wire.contains("top secret contents"));
        assert!(!wire.contains("MESSAGE\""));
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let (tx, rx) = session_pair();
        let envelope = encrypt_control(&tx, &chat("x")).unwrap();
        let (iv, tag, payload) = match envelope {
            ControlMessage::Encrypted { iv, tag, payload } => (iv, tag, payload),
            _ => unreachable!(),
        };

        // Flip one byte of ciphertext.
        let mut raw = BASE64.decode(&payload).unwrap();
        raw[0] ^= 0x01;
        let bad_payload = BASE64.encode(raw);

        let err = decrypt_control(&rx, &iv, &tag, &bad_payload).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (tx, _) = session_pair();
        let (_, stranger) = session_pair();
        let envelope = encrypt_control(&tx, &chat("x")).unwrap();
        let (iv, tag, payload) = match envelope {
            ControlMessage::Encrypted { iv, tag, payload } => (iv, tag, payload),
            _ => unreachable!(),
        };
        assert!(matches!(
            decrypt_control(&stranger, &iv, &tag, &payload),
            Err(Error::Decryption(_))
        ));
    }

    #[test]
    fn test_nesting_is_refused() {
        let (tx, _) = session_pair();
        let envelope = encrypt_control(&tx, &chat("x")).unwrap();
        assert!(matches!(
            encrypt_control(&tx, &envelope),
            Err(Error::Policy(_))
        ));
    }

    #[test]
    fn test_bad_iv_length_fails() {
        let (tx, rx) = session_pair();
        let envelope = encrypt_control(&tx, &chat("x")).unwrap();
        let (_, tag, payload) = match envelope {
            ControlMessage::Encrypted { iv, tag, payload } => (iv, tag, payload),
            _ => unreachable!(),
        };
        let short_iv = BASE64.encode([0u8; 8]);
        assert!(matches!(
            decrypt_control(&rx, &short_iv, &tag, &payload),
            Err(Error::Decryption(_))
        ));
    }
}
