//! Message classification per the frame shape table, plus the WHERE field
//! derivations each protocol must reproduce.

use opennetty::{
    frame::{Frame, FrameError},
    message::{
        address::AddressKind, Medium, Message, MessageError, MessageType, Mode, Protocol,
    },
};
use rstest::rstest;

fn message(protocol: Protocol, text: &str) -> Message {
    let frame = Frame::parse(text).expect("frame must parse");
    Message::from_frame(protocol, frame).expect("message must classify")
}

#[rstest]
#[case("*#*0##", MessageType::NegativeAcknowledgement)]
#[case("*#*1##", MessageType::Acknowledgement)]
#[case("*1*0*7##", MessageType::BusCommand)]
#[case("*#1*7##", MessageType::StatusRequest)]
#[case("*#13**16##", MessageType::DimensionRequest)]
#[case("*#13**16*2*1*40##", MessageType::DimensionRead)]
#[case("*#1*7*#1*100##", MessageType::DimensionSet)]
fn classification_table(#[case] text: &str, #[case] expected: MessageType) {
    assert_eq!(message(Protocol::Scs, text).kind(), expected);
}

#[rstest]
#[case("*1*2*3*4##")]
#[case("*#*1*2##")]
#[case("*99*9##")]
fn unclassifiable_frames_stay_unknown(#[case] text: &str) {
    assert_eq!(message(Protocol::Scs, text).kind(), MessageType::Unknown);
}

#[test]
fn busy_nack_classifies_on_zigbee_only() {
    assert_eq!(
        message(Protocol::Zigbee, "*#*6##").kind(),
        MessageType::BusyNegativeAcknowledgement
    );
    for protocol in [Protocol::Scs, Protocol::Nitoo] {
        let frame = Frame::parse("*#*6##").expect("frame");
        let err = Message::from_frame(protocol, frame).expect_err("must reject");
        assert!(
            matches!(err, MessageError::Frame(FrameError::Malformed(_))),
            "busy NACK off Zigbee must fail classification, got {err:?}"
        );
    }
}

#[test]
fn zigbee_broadcast_where_derivation() {
    let decoded = message(Protocol::Zigbee, "*1*1*0#01234500#9##");
    assert_eq!(decoded.mode(), Some(Mode::Broadcast));
    assert_eq!(decoded.medium(), Some(Medium::Radio));
    let address = decoded.address().expect("address");
    assert_eq!(address.kind(), AddressKind::ZigbeeSpecificDeviceAllUnits);
    assert_eq!(address.value(), "01234500");
}

#[test]
fn zigbee_all_devices_where_derivation() {
    let decoded = message(Protocol::Zigbee, "*1*1*00#9##");
    assert_eq!(decoded.mode(), Some(Mode::Unicast));
    let address = decoded.address().expect("address");
    assert_eq!(address.kind(), AddressKind::ZigbeeAllDevicesAllUnits);
}

#[rstest]
#[case("*1*1*0#7##", Some(Mode::Broadcast), Some(Medium::Powerline))]
#[case("*1*1*112#1##", Some(Mode::Unicast), Some(Medium::Radio))]
#[case("*1*1*#112#2##", Some(Mode::Multicast), Some(Medium::Infrared))]
fn nitoo_where_derivation(
    #[case] text: &str,
    #[case] mode: Option<Mode>,
    #[case] medium: Option<Medium>,
) {
    let decoded = message(Protocol::Nitoo, text);
    assert_eq!(decoded.mode(), mode);
    assert_eq!(decoded.medium(), medium);
}

#[test]
fn nitoo_unit_versus_device_addresses() {
    let unit = message(Protocol::Nitoo, "*1*1*19749##");
    assert_eq!(
        unit.address().expect("address").kind(),
        AddressKind::NitooUnit
    );
    let device = message(Protocol::Nitoo, "*1*1*19744##");
    assert_eq!(
        device.address().expect("address").kind(),
        AddressKind::NitooDevice
    );
}

#[rstest]
#[case("*1*0*0##", AddressKind::ScsGeneral)]
#[case("*1*0*00##", AddressKind::ScsArea)]
#[case("*1*0*7##", AddressKind::ScsArea)]
#[case("*1*0*#5##", AddressKind::ScsGroup)]
#[case("*1*0*75##", AddressKind::ScsPointToPoint)]
#[case("*1*0*1015##", AddressKind::ScsPointToPoint)]
fn scs_where_derivation(#[case] text: &str, #[case] kind: AddressKind) {
    let decoded = message(Protocol::Scs, text);
    assert_eq!(decoded.address().expect("address").kind(), kind);
    assert_eq!(decoded.medium(), Some(Medium::Bus));
    assert_eq!(decoded.mode(), None);
}

#[test]
fn values_are_collected_in_order() {
    let read = message(Protocol::Scs, "*#13**16*2*1*40##");
    assert_eq!(read.values(), ["2", "1", "40"]);
    let dimension = read.dimension().expect("dimension");
    assert_eq!(dimension.code(), "16");
    assert_eq!(dimension.category().who(), "13");
}
