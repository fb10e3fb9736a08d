//! Typed view over OpenWebNet frames.
//!
//! A [`Message`] pairs a [`Frame`] with everything the runtime derives from
//! it: the message type, the WHO category, the command or dimension, the
//! WHERE address with its mode and medium, and any value fields. The
//! constructors synthesise the exact field shapes of the protocol — the
//! leading empty parameter that turns `WHO` into `#WHO` distinguishes
//! requests from commands — and classification is the inverse of that
//! synthesis. Two messages are equal when protocol and frame are equal.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{Field, Frame, FrameError, Parameter};

pub mod address;

use address::{decode_where, encode_where, Address, AddressError, WhereParts};

/// Physical-layer family behind a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Legrand In One powerline/radio/infrared.
    Nitoo,
    /// Wired MyHome bus.
    Scs,
    /// MyHome Play radio.
    Zigbee,
}

/// Transmission medium named by a WHERE family digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Medium {
    /// The wired SCS bus.
    Bus,
    /// Nitoo powerline carrier.
    Powerline,
    /// Nitoo or Zigbee radio.
    Radio,
    /// Nitoo infrared.
    Infrared,
}

/// Delivery mode encoded in a WHERE field prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Every device on the medium.
    Broadcast,
    /// A set of devices.
    Multicast,
    /// A single device or unit.
    Unicast,
}

/// Message classification per the frame shape table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `*#*1##`.
    Acknowledgement,
    /// `*#*0##`.
    NegativeAcknowledgement,
    /// `*#*6##`, legal on Zigbee only.
    BusyNegativeAcknowledgement,
    /// `*WHO*WHAT*WHERE##`.
    BusCommand,
    /// `*#WHO*WHERE##`.
    StatusRequest,
    /// `*#WHO*WHERE*DIM##`.
    DimensionRequest,
    /// `*#WHO*WHERE*DIM*V1*…##`.
    DimensionRead,
    /// `*#WHO*WHERE*#DIM*V1*…##`.
    DimensionSet,
    /// Any other well-formed frame.
    Unknown,
}

/// Errors raised while building or classifying messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The protocol value lies outside the closed set for this operation.
    #[error("unsupported protocol for this operation")]
    UnsupportedProtocol,
    /// The medium is not carried by the protocol's physical layer.
    #[error("unsupported medium for this protocol")]
    UnsupportedMedium,
    /// Frame construction or classification failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// WHERE field decoding or address validation failed.
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// An OpenWebNet WHO category with optional extra parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Category {
    who: String,
    parameters: Vec<String>,
}

impl Category {
    /// Create a category from its WHO digits.
    ///
    /// # Errors
    /// [`MessageError::Frame`] if `who` is empty or not digits-only.
    pub fn new(who: impl Into<String>) -> Result<Self, MessageError> {
        let who = who.into();
        if who.is_empty() || !who.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::NonDigitParameter.into());
        }
        Ok(Self {
            who,
            parameters: Vec::new(),
        })
    }

    /// Derive a category carrying extra WHO parameters.
    ///
    /// # Errors
    /// [`MessageError::Frame`] if a parameter is not digits-only.
    pub fn with_parameters<S: AsRef<str>>(
        mut self,
        parameters: &[S],
    ) -> Result<Self, MessageError> {
        for p in parameters {
            let p = p.as_ref();
            if !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FrameError::NonDigitParameter.into());
            }
            self.parameters.push(p.to_owned());
        }
        Ok(self)
    }

    /// WHO 1.
    #[must_use]
    pub fn lighting() -> Self { Self::well_known("1") }

    /// WHO 2.
    #[must_use]
    pub fn automation() -> Self { Self::well_known("2") }

    /// WHO 4.
    #[must_use]
    pub fn temperature() -> Self { Self::well_known("4") }

    /// WHO 5.
    #[must_use]
    pub fn alarm() -> Self { Self::well_known("5") }

    /// WHO 13.
    #[must_use]
    pub fn management() -> Self { Self::well_known("13") }

    /// WHO 25.
    #[must_use]
    pub fn scenarios() -> Self { Self::well_known("25") }

    /// WHO 1000.
    #[must_use]
    pub fn diagnostics() -> Self { Self::well_known("1000") }

    fn well_known(who: &str) -> Self {
        Self {
            who: who.to_owned(),
            parameters: Vec::new(),
        }
    }

    /// The WHO digits.
    #[must_use]
    pub fn who(&self) -> &str { &self.who }

    /// Extra WHO parameters.
    #[must_use]
    pub fn parameters(&self) -> &[String] { &self.parameters }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.who)?;
        for p in &self.parameters {
            write!(f, "#{p}")?;
        }
        Ok(())
    }
}

/// A WHAT directive within a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    category: Category,
    what: String,
    parameters: Vec<String>,
}

impl Command {
    /// Create a command from its category and WHAT digits.
    ///
    /// # Errors
    /// [`MessageError::Frame`] if `what` is empty or not digits-only.
    pub fn new(category: Category, what: impl Into<String>) -> Result<Self, MessageError> {
        let what = what.into();
        if what.is_empty() || !what.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::NonDigitParameter.into());
        }
        Ok(Self {
            category,
            what,
            parameters: Vec::new(),
        })
    }

    /// Derive a command with extra WHAT parameters appended.
    ///
    /// # Errors
    /// [`MessageError::Frame`] if a parameter is not digits-only.
    pub fn with_parameters<S: AsRef<str>>(
        mut self,
        parameters: &[S],
    ) -> Result<Self, MessageError> {
        for p in parameters {
            let p = p.as_ref();
            if !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FrameError::NonDigitParameter.into());
            }
            self.parameters.push(p.to_owned());
        }
        Ok(self)
    }

    /// The command's category.
    #[must_use]
    pub const fn category(&self) -> &Category { &self.category }

    /// The WHAT digits.
    #[must_use]
    pub fn what(&self) -> &str { &self.what }

    /// The WHAT parameters.
    #[must_use]
    pub fn parameters(&self) -> &[String] { &self.parameters }
}

/// A DIMENSION code within a category, shared by requests, reads and sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dimension {
    category: Category,
    code: String,
    parameters: Vec<String>,
}

impl Dimension {
    /// Create a dimension from its category and code digits.
    ///
    /// # Errors
    /// [`MessageError::Frame`] if `code` is empty or not digits-only.
    pub fn new(category: Category, code: impl Into<String>) -> Result<Self, MessageError> {
        let code = code.into();
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::NonDigitParameter.into());
        }
        Ok(Self {
            category,
            code,
            parameters: Vec::new(),
        })
    }

    /// Derive a dimension with extra parameters appended.
    ///
    /// # Errors
    /// [`MessageError::Frame`] if a parameter is not digits-only.
    pub fn with_parameters<S: AsRef<str>>(
        mut self,
        parameters: &[S],
    ) -> Result<Self, MessageError> {
        for p in parameters {
            let p = p.as_ref();
            if !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FrameError::NonDigitParameter.into());
            }
            self.parameters.push(p.to_owned());
        }
        Ok(self)
    }

    /// The dimension's category.
    #[must_use]
    pub const fn category(&self) -> &Category { &self.category }

    /// The dimension code digits.
    #[must_use]
    pub fn code(&self) -> &str { &self.code }

    /// The dimension parameters.
    #[must_use]
    pub fn parameters(&self) -> &[String] { &self.parameters }
}

/// A classified frame with its derived parts.
#[derive(Debug, Clone)]
pub struct Message {
    protocol: Protocol,
    frame: Frame,
    kind: MessageType,
    category: Option<Category>,
    command: Option<Command>,
    dimension: Option<Dimension>,
    address: Option<Address>,
    mode: Option<Mode>,
    medium: Option<Medium>,
    values: Vec<String>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.frame == other.frame
    }
}

impl Eq for Message {}

impl std::hash::Hash for Message {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.frame.hash(state);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.frame.fmt(f) }
}

impl Message {
    /// Classify a parsed frame for the given protocol.
    ///
    /// Frames matching no row of the shape table come back as
    /// [`MessageType::Unknown`] rather than an error; the single exception
    /// is a BUSY NACK seen outside Zigbee, which no gateway may legally
    /// emit and which is rejected as a malformed frame.
    ///
    /// # Errors
    /// [`MessageError::Frame`] for the off-protocol BUSY NACK and
    /// [`MessageError::Address`] when a WHERE field fits no shape of the
    /// protocol's addressing table.
    pub fn from_frame(protocol: Protocol, frame: Frame) -> Result<Self, MessageError> {
        let fields = frame.fields();
        let first = fields.first().map(Field::parameters).unwrap_or_default();
        if let [a, b] = first {
            if a.is_empty() && b.is_empty() {
                return Self::from_acknowledgement_frame(protocol, frame);
            }
        }
        if let Some(who) = request_who(first) {
            return Self::from_request_frame(protocol, frame, &who);
        }
        if fields.len() == 3 && first.first().is_some_and(|p| !p.is_empty()) {
            return Self::from_command_frame(protocol, frame);
        }
        Ok(Self::unknown(protocol, frame))
    }

    fn unknown(protocol: Protocol, frame: Frame) -> Self {
        Self {
            protocol,
            frame,
            kind: MessageType::Unknown,
            category: None,
            command: None,
            dimension: None,
            address: None,
            mode: None,
            medium: None,
            values: Vec::new(),
        }
    }

    fn from_acknowledgement_frame(
        protocol: Protocol,
        frame: Frame,
    ) -> Result<Self, MessageError> {
        let kind = match ack_code(&frame) {
            Some("0") => MessageType::NegativeAcknowledgement,
            Some("1") => MessageType::Acknowledgement,
            Some("6") if protocol == Protocol::Zigbee => {
                MessageType::BusyNegativeAcknowledgement
            }
            Some("6") => {
                return Err(FrameError::Malformed(
                    "busy negative acknowledgement outside Zigbee",
                )
                .into());
            }
            _ => MessageType::Unknown,
        };
        Ok(Self {
            kind,
            ..Self::unknown(protocol, frame)
        })
    }

    fn from_request_frame(
        protocol: Protocol,
        frame: Frame,
        who: &Category,
    ) -> Result<Self, MessageError> {
        let fields = frame.fields();
        let Some(where_field) = fields.get(1) else {
            return Ok(Self::unknown(protocol, frame));
        };
        let WhereParts {
            address,
            mode,
            medium,
        } = decode_where(protocol, where_field)?;
        let kind;
        let mut dimension = None;
        let mut values = Vec::new();
        match fields.len() {
            2 => kind = MessageType::StatusRequest,
            3 => {
                kind = MessageType::DimensionRequest;
                dimension = dimension_from_field(who.clone(), &fields[2], false)?;
            }
            _ => {
                let marker = fields[2]
                    .parameters()
                    .first()
                    .is_some_and(Parameter::is_empty);
                kind = if marker {
                    MessageType::DimensionSet
                } else {
                    MessageType::DimensionRead
                };
                dimension = dimension_from_field(who.clone(), &fields[2], marker)?;
                values = fields[3..].iter().map(ToString::to_string).collect();
            }
        }
        if dimension.is_none() && fields.len() > 2 {
            return Ok(Self::unknown(protocol, frame));
        }
        Ok(Self {
            protocol,
            frame,
            kind,
            category: Some(who.clone()),
            command: None,
            dimension,
            address,
            mode,
            medium,
            values,
        })
    }

    fn from_command_frame(protocol: Protocol, frame: Frame) -> Result<Self, MessageError> {
        let fields = frame.fields();
        let who_params: Vec<&str> = fields[0]
            .parameters()
            .iter()
            .map(Parameter::as_str)
            .collect();
        let Ok(category) = category_from_parts(&who_params) else {
            return Ok(Self::unknown(protocol, frame));
        };
        let what_params: Vec<&str> = fields[1]
            .parameters()
            .iter()
            .map(Parameter::as_str)
            .collect();
        let Some((what, rest)) = what_params.split_first().filter(|(w, _)| !w.is_empty())
        else {
            return Ok(Self::unknown(protocol, frame));
        };
        let command = Command::new(category.clone(), *what)
            .and_then(|c| c.with_parameters(rest))
            .ok();
        let Some(command) = command else {
            return Ok(Self::unknown(protocol, frame));
        };
        let WhereParts {
            address,
            mode,
            medium,
        } = decode_where(protocol, &fields[2])?;
        Ok(Self {
            protocol,
            frame,
            kind: MessageType::BusCommand,
            category: Some(category),
            command: Some(command),
            dimension: None,
            address,
            mode,
            medium,
            values: Vec::new(),
        })
    }

    /// Build a BUS COMMAND message.
    ///
    /// # Errors
    /// [`MessageError::UnsupportedMedium`] when the medium does not belong
    /// to the protocol, plus frame construction errors.
    pub fn bus_command(
        protocol: Protocol,
        command: &Command,
        address: Option<&Address>,
        medium: Option<Medium>,
        mode: Option<Mode>,
    ) -> Result<Self, MessageError> {
        validate_medium(protocol, medium)?;
        let fields = vec![
            category_field(command.category(), false)?,
            code_field(command.what(), command.parameters(), false)?,
            encode_where(protocol, address, mode, medium)?,
        ];
        Self::from_frame(protocol, Frame::new(fields)?)
    }

    /// Build a STATUS REQUEST message.
    ///
    /// # Errors
    /// As [`Message::bus_command`].
    pub fn status_request(
        protocol: Protocol,
        category: &Category,
        address: Option<&Address>,
        medium: Option<Medium>,
        mode: Option<Mode>,
    ) -> Result<Self, MessageError> {
        validate_medium(protocol, medium)?;
        let fields = vec![
            category_field(category, true)?,
            encode_where(protocol, address, mode, medium)?,
        ];
        Self::from_frame(protocol, Frame::new(fields)?)
    }

    /// Build a DIMENSION REQUEST message.
    ///
    /// # Errors
    /// As [`Message::bus_command`].
    pub fn dimension_request(
        protocol: Protocol,
        dimension: &Dimension,
        address: Option<&Address>,
        medium: Option<Medium>,
        mode: Option<Mode>,
    ) -> Result<Self, MessageError> {
        validate_medium(protocol, medium)?;
        let fields = vec![
            category_field(dimension.category(), true)?,
            encode_where(protocol, address, mode, medium)?,
            code_field(dimension.code(), dimension.parameters(), false)?,
        ];
        Self::from_frame(protocol, Frame::new(fields)?)
    }

    /// Build a DIMENSION SET message; `values` must not be empty.
    ///
    /// # Errors
    /// As [`Message::bus_command`], plus a malformed-frame error when
    /// `values` is empty.
    pub fn dimension_set<S: AsRef<str>>(
        protocol: Protocol,
        dimension: &Dimension,
        values: &[S],
        address: Option<&Address>,
        medium: Option<Medium>,
        mode: Option<Mode>,
    ) -> Result<Self, MessageError> {
        Self::dimension_write(protocol, dimension, values, address, medium, mode, true)
    }

    /// Build a DIMENSION READ message (a gateway reply; exposed for stub
    /// gateways and the coordinator).
    ///
    /// # Errors
    /// As [`Message::dimension_set`].
    pub fn dimension_read<S: AsRef<str>>(
        protocol: Protocol,
        dimension: &Dimension,
        values: &[S],
        address: Option<&Address>,
        medium: Option<Medium>,
        mode: Option<Mode>,
    ) -> Result<Self, MessageError> {
        Self::dimension_write(protocol, dimension, values, address, medium, mode, false)
    }

    #[allow(clippy::too_many_arguments, reason = "internal fan-in for the two writers")]
    fn dimension_write<S: AsRef<str>>(
        protocol: Protocol,
        dimension: &Dimension,
        values: &[S],
        address: Option<&Address>,
        medium: Option<Medium>,
        mode: Option<Mode>,
        set_marker: bool,
    ) -> Result<Self, MessageError> {
        validate_medium(protocol, medium)?;
        if values.is_empty() {
            return Err(FrameError::Malformed("dimension write needs values").into());
        }
        let mut fields = vec![
            category_field(dimension.category(), true)?,
            encode_where(protocol, address, mode, medium)?,
            code_field(dimension.code(), dimension.parameters(), set_marker)?,
        ];
        for value in values {
            fields.push(Field::single(value.as_ref())?);
        }
        Self::from_frame(protocol, Frame::new(fields)?)
    }

    /// The positive acknowledgement `*#*1##`.
    #[must_use]
    pub fn acknowledgement(protocol: Protocol) -> Self {
        Self::fixed(protocol, MessageType::Acknowledgement, "1")
    }

    /// The negative acknowledgement `*#*0##`.
    #[must_use]
    pub fn negative_acknowledgement(protocol: Protocol) -> Self {
        Self::fixed(protocol, MessageType::NegativeAcknowledgement, "0")
    }

    /// The Zigbee busy acknowledgement `*#*6##`.
    ///
    /// # Errors
    /// [`MessageError::UnsupportedProtocol`] outside Zigbee.
    pub fn busy_negative_acknowledgement(protocol: Protocol) -> Result<Self, MessageError> {
        if protocol != Protocol::Zigbee {
            return Err(MessageError::UnsupportedProtocol);
        }
        Ok(Self::fixed(
            protocol,
            MessageType::BusyNegativeAcknowledgement,
            "6",
        ))
    }

    fn fixed(protocol: Protocol, kind: MessageType, code: &str) -> Self {
        // The three acknowledgement frames are static shapes; building them
        // from parts cannot fail.
        let marker = Field::new(vec![Parameter::empty(), Parameter::empty()])
            .unwrap_or_else(|_| unreachable!("marker field has two parameters"));
        let code = Field::single(code).unwrap_or_else(|_| unreachable!("digit code"));
        let frame =
            Frame::new(vec![marker, code]).unwrap_or_else(|_| unreachable!("two fields"));
        Self {
            kind,
            ..Self::unknown(protocol, frame)
        }
    }

    /// The protocol this message belongs to.
    #[must_use]
    pub const fn protocol(&self) -> Protocol { self.protocol }

    /// The underlying frame.
    #[must_use]
    pub const fn frame(&self) -> &Frame { &self.frame }

    /// The message classification.
    #[must_use]
    pub const fn kind(&self) -> MessageType { self.kind }

    /// The WHO category, when the shape carries one.
    #[must_use]
    pub const fn category(&self) -> Option<&Category> { self.category.as_ref() }

    /// The command, for BUS COMMANDs.
    #[must_use]
    pub const fn command(&self) -> Option<&Command> { self.command.as_ref() }

    /// The dimension, for dimension shapes.
    #[must_use]
    pub const fn dimension(&self) -> Option<&Dimension> { self.dimension.as_ref() }

    /// The WHERE address, when present.
    #[must_use]
    pub const fn address(&self) -> Option<&Address> { self.address.as_ref() }

    /// The delivery mode, when the WHERE field encodes one.
    #[must_use]
    pub const fn mode(&self) -> Option<Mode> { self.mode }

    /// The medium, when the WHERE field encodes one.
    #[must_use]
    pub const fn medium(&self) -> Option<Medium> { self.medium }

    /// Value fields of dimension reads and sets, in order.
    #[must_use]
    pub fn values(&self) -> &[String] { &self.values }

    /// Whether this is one of the three acknowledgement shapes.
    #[must_use]
    pub const fn is_acknowledgement_kind(&self) -> bool {
        matches!(
            self.kind,
            MessageType::Acknowledgement
                | MessageType::NegativeAcknowledgement
                | MessageType::BusyNegativeAcknowledgement
        )
    }
}

/// WHO category parsed from a request-family first field (`#WHO…`), if the
/// field matches that shape.
fn request_who(params: &[Parameter]) -> Option<Category> {
    let (first, rest) = params.split_first()?;
    if !first.is_empty() {
        return None;
    }
    let parts: Vec<&str> = rest.iter().map(Parameter::as_str).collect();
    category_from_parts(&parts).ok()
}

fn category_from_parts(parts: &[&str]) -> Result<Category, MessageError> {
    let (who, rest) = parts
        .split_first()
        .ok_or(MessageError::Frame(FrameError::Malformed("empty field")))?;
    if who.is_empty() {
        return Err(FrameError::Malformed("empty WHO").into());
    }
    Category::new(*who)?.with_parameters(rest)
}

fn ack_code(frame: &Frame) -> Option<&str> {
    let fields = frame.fields();
    if fields.len() != 2 {
        return None;
    }
    match fields[1].parameters() {
        [code] if !code.is_empty() => Some(code.as_str()),
        _ => None,
    }
}

fn dimension_from_field(
    category: Category,
    field: &Field,
    skip_marker: bool,
) -> Result<Option<Dimension>, MessageError> {
    let params: Vec<&str> = field.parameters().iter().map(Parameter::as_str).collect();
    let params = if skip_marker { &params[1..] } else { &params[..] };
    let Some((code, rest)) = params.split_first().filter(|(c, _)| !c.is_empty()) else {
        return Ok(None);
    };
    Ok(Some(
        Dimension::new(category, *code)?.with_parameters(rest)?,
    ))
}

fn category_field(category: &Category, request: bool) -> Result<Field, FrameError> {
    let mut parameters = Vec::new();
    if request {
        parameters.push(Parameter::empty());
    }
    parameters.push(Parameter::new(category.who())?);
    for p in category.parameters() {
        parameters.push(Parameter::new(p.as_str())?);
    }
    Field::new(parameters)
}

fn code_field(code: &str, extra: &[String], set_marker: bool) -> Result<Field, FrameError> {
    let mut parameters = Vec::new();
    if set_marker {
        parameters.push(Parameter::empty());
    }
    parameters.push(Parameter::new(code)?);
    for p in extra {
        parameters.push(Parameter::new(p.as_str())?);
    }
    Field::new(parameters)
}

fn validate_medium(protocol: Protocol, medium: Option<Medium>) -> Result<(), MessageError> {
    let legal = match (protocol, medium) {
        (_, None) => true,
        (Protocol::Scs, Some(Medium::Bus)) | (Protocol::Zigbee, Some(Medium::Radio)) => true,
        (
            Protocol::Nitoo,
            Some(Medium::Powerline | Medium::Radio | Medium::Infrared),
        ) => true,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(MessageError::UnsupportedMedium)
    }
}
