//! Session cryptography.
//!
//! - X25519 ephemeral key exchange per connection (perfect forward secrecy)
//! - session key = SHA-256 of the raw ECDH shared secret
//! - AES-256-GCM for control frames (authenticated, fresh IV per frame)
//! - AES-256-CTR for file streams (streamable; integrity via end-of-transfer
//!   SHA-256)
//!
//! No key material is ever persisted; every reconnect re-keys.

pub mod envelope;
pub mod handshake;
pub mod session;
pub mod stream;

pub use envelope::{decrypt_control, encrypt_control};
pub use handshake::Keypair;
pub use session::{SessionCrypto, CTR_IV_LEN};
pub use stream::{StreamDecryptor, StreamEncryptor};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::network::protocol::{ControlMessage, MessageBody};

    #[test]
    fn test_full_handshake_and_message_workflow() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let alice_spki = alice.public_spki();
        let bob_spki = bob.public_spki();

        let alice_session = SessionCrypto::new(alice.agree(&bob_spki).unwrap());
        let bob_session = SessionCrypto::new(bob.agree(&alice_spki).unwrap());

        let msg = ControlMessage::Message {
            from: "alice".into(),
            id: "m-1".into(),
            ts: 1,
            body: MessageBody::Text {
                text: "Hello from Alice!".into(),
            },
        };

        let envelope = encrypt_control(&alice_session, &msg).unwrap();
        let inner = match &envelope {
            ControlMessage::Encrypted { iv, tag, payload } => {
                decrypt_control(&bob_session, iv, tag, payload).unwrap()
            }
            other => panic!("expected envelope, got {:?}", other),
        };
        assert_eq!(inner, msg);

        // Stream cipher shares the same session key.
        let (mut enc, iv) = bob_session.stream_encryptor();
        let mut data = b"file contents".to_vec();
        enc.apply(&mut data);
        let mut dec = alice_session.stream_decryptor(&iv);
        dec.apply(&mut data);
        assert_eq!(data, b"file contents");
    }
}
