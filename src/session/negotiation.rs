//! The three-branch session handshake.
//!
//! Generic sessions either enable supervision (`*13*66*##`) or probe the
//! gateway's firmware version (`*#13**16##`); Command and Event sessions
//! wait for the gateway's greeting, select the session type with `*99*S##`
//! and then follow whichever authentication scheme the gateway demands:
//! none, the digest exchange, or the legacy OPEN scramble.

use std::sync::Arc;

use tracing::debug;

use super::{auth, SessionError, SessionType};
use crate::{
    connection::Connection,
    frame::{Field, Frame, Parameter},
    gateway::Gateway,
    message::{Message, MessageType, Protocol},
};

/// Session-type selector digits for `*99*S##`.
const SELECT_COMMAND: &str = "9";
const SELECT_EVENT: &str = "1";

/// Run the handshake for the requested session type.
pub(super) async fn run(
    gateway: &Arc<Gateway>,
    session_type: SessionType,
    connection: &Connection,
) -> Result<(), SessionError> {
    match session_type {
        SessionType::Generic => negotiate_generic(gateway, connection).await,
        SessionType::Command => negotiate_selected(gateway, connection, SELECT_COMMAND).await,
        SessionType::Event => negotiate_selected(gateway, connection, SELECT_EVENT).await,
    }
}

/// Read the next frame, failing on end of stream.
pub(super) async fn next_frame(connection: &Connection) -> Result<Frame, SessionError> {
    match connection.receive().await? {
        Some(frame) => Ok(frame),
        None => Err(SessionError::UnexpectedFrame("stream closed mid-handshake")),
    }
}

async fn next_message(
    gateway: &Gateway,
    connection: &Connection,
) -> Result<Message, SessionError> {
    let frame = next_frame(connection).await?;
    Ok(Message::from_frame(gateway.protocol(), frame)?)
}

async fn expect_acknowledgement(
    gateway: &Gateway,
    connection: &Connection,
) -> Result<(), SessionError> {
    match next_message(gateway, connection).await?.kind() {
        MessageType::Acknowledgement => Ok(()),
        MessageType::NegativeAcknowledgement => Err(SessionError::InvalidFrame),
        _ => Err(SessionError::UnexpectedFrame("expected acknowledgement")),
    }
}

async fn negotiate_generic(
    gateway: &Arc<Gateway>,
    connection: &Connection,
) -> Result<(), SessionError> {
    if gateway.options().supervision {
        let enable = supervision_frame()?;
        connection.send(&enable).await?;
        return expect_acknowledgement(gateway, connection).await;
    }
    let probe = firmware_version_request(gateway.protocol())?;
    connection.send(probe.frame()).await?;

    // Nitoo gateways reply with the firmware read alone; SCS and Zigbee
    // also acknowledge, in either order.
    let mut needs_ack = gateway.protocol() != Protocol::Nitoo;
    let mut needs_read = true;
    while needs_ack || needs_read {
        match next_message(gateway, connection).await?.kind() {
            MessageType::DimensionRead if needs_read => needs_read = false,
            MessageType::Acknowledgement if needs_ack => needs_ack = false,
            MessageType::NegativeAcknowledgement => return Err(SessionError::InvalidFrame),
            _ => {
                return Err(SessionError::UnexpectedFrame(
                    "expected firmware version reply",
                ));
            }
        }
    }
    Ok(())
}

async fn negotiate_selected(
    gateway: &Arc<Gateway>,
    connection: &Connection,
    selector: &str,
) -> Result<(), SessionError> {
    expect_acknowledgement(gateway, connection).await?;
    connection.send(&selection_frame(selector)?).await?;

    let reply = next_frame(connection).await?;
    if let Some(method) = digest_challenge(&reply) {
        debug!(method, "gateway demands digest authentication");
        return auth::digest_login(gateway, connection, method).await;
    }
    if let Some(nonce) = auth::digits_frame(&reply) {
        debug!("gateway demands legacy OPEN authentication");
        return auth::legacy_login(gateway, connection, nonce).await;
    }
    match Message::from_frame(gateway.protocol(), reply)?.kind() {
        MessageType::Acknowledgement => Ok(()),
        MessageType::NegativeAcknowledgement => Err(SessionError::InvalidFrame),
        _ => Err(SessionError::UnexpectedFrame("expected session-type reply")),
    }
}

/// `*13*66*##`, the supervision enable frame.
fn supervision_frame() -> Result<Frame, SessionError> {
    let fields = vec![
        Field::single("13")?,
        Field::single("66")?,
        Field::new(vec![Parameter::empty()])?,
    ];
    Ok(Frame::new(fields)?)
}

/// `*99*S##`, the session-type selection frame.
fn selection_frame(selector: &str) -> Result<Frame, SessionError> {
    let fields = vec![Field::single("99")?, Field::single(selector)?];
    Ok(Frame::new(fields)?)
}

/// `*#13**16##`, the firmware version dimension request.
fn firmware_version_request(protocol: Protocol) -> Result<Message, SessionError> {
    use crate::message::{Category, Dimension};
    let dimension = Dimension::new(Category::management(), "16")?;
    Ok(Message::dimension_request(protocol, &dimension, None, None, None)?)
}

/// The digest method digit of a `*98*M##` challenge, if the frame is one.
fn digest_challenge(frame: &Frame) -> Option<&str> {
    let fields = frame.fields();
    if fields.len() != 2 {
        return None;
    }
    let header = fields[0].parameters();
    if header.len() != 1 || header[0].as_str() != "98" {
        return None;
    }
    match fields[1].parameters() {
        [method] if !method.is_empty() => Some(method.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_frames_have_the_wire_shape() {
        assert_eq!(
            selection_frame(SELECT_COMMAND).expect("frame").to_string(),
            "*99*9##"
        );
        assert_eq!(
            selection_frame(SELECT_EVENT).expect("frame").to_string(),
            "*99*1##"
        );
        assert_eq!(
            supervision_frame().expect("frame").to_string(),
            "*13*66*##"
        );
        assert_eq!(
            firmware_version_request(Protocol::Scs)
                .expect("message")
                .to_string(),
            "*#13**16##"
        );
    }

    #[test]
    fn digest_challenge_matches_only_98_frames() {
        let challenge = Frame::parse("*98*2##").expect("frame");
        assert_eq!(digest_challenge(&challenge), Some("2"));
        let other = Frame::parse("*99*2##").expect("frame");
        assert_eq!(digest_challenge(&other), None);
        let ack = Frame::parse("*#*1##").expect("frame");
        assert_eq!(digest_challenge(&ack), None);
    }
}
