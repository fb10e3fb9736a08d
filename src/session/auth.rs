//! OpenWebNet authentication: the digest exchange and the legacy scramble.
//!
//! The digest scheme hashes ASCII material — hex strings and two fixed tags
//! — with SHA-1 or SHA-256; nonces and digests travel as decimal digit
//! pairs, two digits per nibble. The legacy OPEN scheme obfuscates a
//! numeric password with a fixed table of 32-bit rotations. It is preserved
//! bit-exact for interoperability only and offers no security on untrusted
//! networks.

use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use super::SessionError;
use crate::{
    connection::Connection,
    frame::{Field, Frame, Parameter},
    gateway::Gateway,
    message::Message,
};

/// First fixed tag mixed into the client digest.
const DIGEST_TAG_A: &str = "736F70653E";
/// Second fixed tag mixed into the client digest.
const DIGEST_TAG_B: &str = "636F70653E";

/// Digest algorithm selected by the gateway's `*98*M##` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestMethod {
    /// Method 1: SHA-1, 20-byte nonces.
    Sha1,
    /// Method 2: SHA-256, 32-byte nonces.
    Sha256,
}

impl DigestMethod {
    /// Map the challenge digit onto a method.
    ///
    /// # Errors
    /// [`SessionError::AuthenticationMethodUnsupported`] for any other
    /// digit.
    pub fn from_code(code: &str) -> Result<Self, SessionError> {
        match code {
            "1" => Ok(Self::Sha1),
            "2" => Ok(Self::Sha256),
            other => Err(SessionError::AuthenticationMethodUnsupported(
                other.to_owned(),
            )),
        }
    }

    /// Nonce length in bytes.
    #[must_use]
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hash `input` and return the lowercase hex digest.
    #[must_use]
    pub fn hash_hex(self, input: &str) -> String {
        match self {
            Self::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// Convert digit pairs to lowercase hex: every two decimal digits encode one
/// nibble (`00`–`15`), four digits per byte.
///
/// # Errors
/// [`SessionError::AuthenticationInvalid`] when the length is not a
/// multiple of four or a pair exceeds 15.
pub fn digits_to_hex(digits: &str) -> Result<String, SessionError> {
    if digits.len() % 4 != 0 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SessionError::AuthenticationInvalid);
    }
    let mut hex = String::with_capacity(digits.len() / 2);
    for pair in digits.as_bytes().chunks(2) {
        let value = (pair[0] - b'0') * 10 + (pair[1] - b'0');
        let nibble =
            char::from_digit(u32::from(value), 16).ok_or(SessionError::AuthenticationInvalid)?;
        hex.push(nibble);
    }
    Ok(hex)
}

/// Convert lowercase hex to digit pairs, the inverse of [`digits_to_hex`].
///
/// # Errors
/// [`SessionError::AuthenticationInvalid`] on non-hex input.
pub fn hex_to_digits(hex: &str) -> Result<String, SessionError> {
    let mut digits = String::with_capacity(hex.len() * 2);
    for nibble in hex.chars() {
        let value = nibble
            .to_digit(16)
            .ok_or(SessionError::AuthenticationInvalid)?;
        digits.push_str(&format!("{value:02}"));
    }
    Ok(digits)
}

/// The digest a client proves itself with: `H(Ns ‖ Nc ‖ tagA ‖ tagB ‖ P)`
/// over hex strings, with `P = hex(H(password))`.
#[must_use]
pub fn compute_client_digest(
    method: DigestMethod,
    server_hex: &str,
    client_hex: &str,
    password: &str,
) -> String {
    let key = method.hash_hex(password);
    method.hash_hex(&format!(
        "{server_hex}{client_hex}{DIGEST_TAG_A}{DIGEST_TAG_B}{key}"
    ))
}

/// The digest a gateway proves itself with: `H(Ns ‖ Nc ‖ P)`.
#[must_use]
pub fn compute_server_digest(
    method: DigestMethod,
    server_hex: &str,
    client_hex: &str,
    password: &str,
) -> String {
    let key = method.hash_hex(password);
    method.hash_hex(&format!("{server_hex}{client_hex}{key}"))
}

/// Apply the legacy OPEN scramble: one 32-bit transformation per nonce
/// digit, starting from the numeric password. Compatibility-only.
#[must_use]
pub fn legacy_scramble(password: u32, nonce: &str) -> u32 {
    let mut p = password;
    for digit in nonce.bytes() {
        p = match digit {
            b'1' => p.rotate_right(7),
            b'2' => p.rotate_right(4),
            b'3' => p.rotate_right(3),
            b'4' => p.rotate_left(1),
            b'5' => p.rotate_left(5),
            b'6' => p.rotate_left(12),
            b'7' => {
                (p & 0x0000_FF00)
                    | (p << 24)
                    | ((p & 0x00FF_0000) >> 16)
                    | ((p & 0xFF00_0000) >> 8)
            }
            b'8' => (p << 16) | (p >> 24) | ((p & 0x00FF_0000) >> 8),
            b'9' => !p,
            _ => p,
        };
    }
    p
}

/// The digits of a `*#<digits>##` frame, if the frame has that shape.
pub(super) fn digits_frame(frame: &Frame) -> Option<&str> {
    let [field] = frame.fields() else { return None };
    match field.parameters() {
        [marker, digits] if marker.is_empty() && !digits.is_empty() => Some(digits.as_str()),
        _ => None,
    }
}

/// Build a `*#<digits>##` frame.
fn make_digits_frame(digits: &str) -> Result<Frame, SessionError> {
    let field = Field::new(vec![Parameter::empty(), Parameter::new(digits)?])?;
    Ok(Frame::new(vec![field])?)
}

async fn send_acknowledgement(
    gateway: &Gateway,
    connection: &Connection,
) -> Result<(), SessionError> {
    let ack = Message::acknowledgement(gateway.protocol());
    Ok(connection.send(ack.frame()).await?)
}

/// Read the next `*#<digits>##` frame; a NACK, end of stream or any other
/// shape fails the handshake.
async fn read_digits(connection: &Connection) -> Result<String, SessionError> {
    let frame = match connection.receive().await {
        Ok(Some(frame)) => frame,
        Ok(None) | Err(_) => return Err(SessionError::AuthenticationInvalid),
    };
    digits_frame(&frame)
        .map(ToOwned::to_owned)
        .ok_or(SessionError::AuthenticationInvalid)
}

/// Run the digest exchange after a `*98*M##` challenge.
pub(super) async fn digest_login(
    gateway: &Gateway,
    connection: &Connection,
    method_code: &str,
) -> Result<(), SessionError> {
    let method = DigestMethod::from_code(method_code)?;
    let Some(password) = gateway.password() else {
        return Err(SessionError::AuthenticationRequired);
    };

    // Accept the algorithm, then collect the server nonce.
    send_acknowledgement(gateway, connection).await?;
    let server_digits = read_digits(connection).await?;
    let server_hex = digits_to_hex(&server_digits)?;

    let mut nonce = vec![0u8; method.nonce_len()];
    rand::thread_rng().fill_bytes(&mut nonce);
    let client_hex = hex::encode(&nonce);

    let client_digest = compute_client_digest(method, &server_hex, &client_hex, password);
    let proof = Frame::new(vec![
        Field::new(vec![
            Parameter::empty(),
            Parameter::new(hex_to_digits(&client_hex)?)?,
        ])?,
        Field::single(hex_to_digits(&client_digest)?)?,
    ])?;
    connection.send(&proof).await?;

    let server_digest_hex = digits_to_hex(&read_digits(connection).await?)?;
    let expected = compute_server_digest(method, &server_hex, &client_hex, password);
    if bool::from(expected.as_bytes().ct_eq(server_digest_hex.as_bytes())) {
        send_acknowledgement(gateway, connection).await?;
        Ok(())
    } else {
        warn!(gateway = gateway.name(), "server digest mismatch");
        Err(SessionError::AuthenticationInvalid)
    }
}

/// Run the legacy OPEN exchange after a bare nonce frame.
pub(super) async fn legacy_login(
    gateway: &Gateway,
    connection: &Connection,
    nonce: &str,
) -> Result<(), SessionError> {
    let Some(password) = gateway.password() else {
        return Err(SessionError::AuthenticationRequired);
    };
    // The legacy scheme only carries numeric passwords of up to nine digits.
    if password.len() > 9 {
        return Err(SessionError::AuthenticationInvalid);
    }
    let numeric: u32 = password
        .parse()
        .map_err(|_| SessionError::AuthenticationInvalid)?;

    let response = legacy_scramble(numeric, nonce);
    connection
        .send(&make_digits_frame(&response.to_string())?)
        .await?;

    match connection.receive().await {
        Ok(Some(frame)) => {
            let reply = Message::from_frame(gateway.protocol(), frame)?;
            if reply.kind() == crate::message::MessageType::Acknowledgement {
                Ok(())
            } else {
                warn!(gateway = gateway.name(), "legacy password rejected");
                Err(SessionError::AuthenticationInvalid)
            }
        }
        Ok(None) | Err(_) => Err(SessionError::AuthenticationInvalid),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("05070000", "5700")]
    #[case("15151515", "ffff")]
    #[case("00000000", "0000")]
    fn digit_hex_pairs(#[case] digits: &str, #[case] hex: &str) {
        assert_eq!(digits_to_hex(digits).expect("digits"), hex);
        assert_eq!(hex_to_digits(hex).expect("hex"), digits);
    }

    #[rstest]
    #[case::odd_length("050")]
    #[case::pair_too_large("16000000")]
    #[case::non_digit("0a070000")]
    fn rejects_bad_digit_strings(#[case] digits: &str) {
        assert!(digits_to_hex(digits).is_err());
    }

    #[test]
    fn legacy_scramble_applies_the_table() {
        // 123456 = 0x0001E240: rol12 -> 0x1E240000, '0' no-op, ror3 ->
        // 0x03C48000.
        assert_eq!(legacy_scramble(123_456, "603"), 0x03C4_8000);
        // NOT is an involution.
        assert_eq!(legacy_scramble(legacy_scramble(7, "9"), "9"), 7);
    }

    #[test]
    fn digest_methods_disagree_on_length() {
        assert_eq!(DigestMethod::Sha1.hash_hex("abcd").len(), 40);
        assert_eq!(DigestMethod::Sha256.hash_hex("abcd").len(), 64);
        assert!(DigestMethod::from_code("3").is_err());
    }

    #[test]
    fn digits_frame_matches_only_bare_digit_frames() {
        let nonce = Frame::parse("*#603##").expect("frame");
        assert_eq!(digits_frame(&nonce), Some("603"));
        let ack = Frame::parse("*#*1##").expect("frame");
        assert_eq!(digits_frame(&ack), None);
        let command = Frame::parse("*1*0*7##").expect("frame");
        assert_eq!(digits_frame(&command), None);
    }

    #[test]
    fn client_digest_is_deterministic() {
        let a = compute_client_digest(DigestMethod::Sha1, "aa", "bb", "abcd");
        let b = compute_client_digest(DigestMethod::Sha1, "aa", "bb", "abcd");
        assert_eq!(a, b);
        let other = compute_client_digest(DigestMethod::Sha1, "aa", "bb", "abce");
        assert_ne!(a, other);
    }
}
