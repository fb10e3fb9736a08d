//! Device addressing across the three OpenWebNet physical layers.
//!
//! A WHERE field carries the target of a command or dimension operation. Its
//! shape differs per protocol: SCS distinguishes general/area/group/
//! point-to-point light points, Zigbee packs a device identifier with a
//! two-digit unit, and Nitoo packs `identifier × 16 + unit` into a single
//! decimal value. [`decode_where`] and [`encode_where`] are the two ends of
//! that mapping; the numeric constructors and accessors are total bijections
//! within their documented ranges.

use std::fmt;

use thiserror::Error;

use super::{Medium, Mode, Protocol};
use crate::frame::{Field, FrameError, Parameter};

/// Largest Nitoo device identifier (24 bits).
pub const NITOO_MAX_IDENTIFIER: u32 = 1 << 24;

/// Errors raised by address construction, conversion or WHERE decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The address shape does not fit the requested conversion.
    #[error("invalid address: {0}")]
    Invalid(&'static str),
    /// A Nitoo identifier or unit was out of range, or the WHERE field did
    /// not match any Nitoo shape.
    #[error("invalid Nitoo address: {0}")]
    InvalidNitoo(&'static str),
    /// An SCS area, point or extension was out of range, or the WHERE field
    /// did not match any SCS shape.
    #[error("invalid SCS address: {0}")]
    InvalidScs(&'static str),
    /// A Zigbee device or unit was out of range, or the WHERE field did not
    /// match any Zigbee shape.
    #[error("invalid Zigbee address: {0}")]
    InvalidZigbee(&'static str),
}

/// The ten concrete addressing shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// A whole Nitoo device (unit 0).
    NitooDevice,
    /// A single unit of a Nitoo device.
    NitooUnit,
    /// Every SCS light point.
    ScsGeneral,
    /// Every SCS light point in one area.
    ScsArea,
    /// A named SCS group.
    ScsGroup,
    /// One SCS light point, optionally behind a bus extension.
    ScsPointToPoint,
    /// Every unit of every Zigbee device.
    ZigbeeAllDevicesAllUnits,
    /// One unit number on every Zigbee device.
    ZigbeeAllDevicesSpecificUnit,
    /// Every unit of one Zigbee device.
    ZigbeeSpecificDeviceAllUnits,
    /// One unit of one Zigbee device.
    ZigbeeSpecificDeviceSpecificUnit,
}

/// A validated device address: kind, WHERE value and WHERE parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    kind: AddressKind,
    value: String,
    parameters: Vec<String>,
}

impl Address {
    /// The address shape.
    #[must_use]
    pub const fn kind(&self) -> AddressKind { self.kind }

    /// The WHERE value digits.
    #[must_use]
    pub fn value(&self) -> &str { &self.value }

    /// The WHERE parameter digits (SCS bus extension, for instance).
    #[must_use]
    pub fn parameters(&self) -> &[String] { &self.parameters }

    /// Address a whole Nitoo device.
    ///
    /// # Errors
    /// [`AddressError::InvalidNitoo`] if `identifier` exceeds 2²⁴.
    pub fn nitoo_device(identifier: u32) -> Result<Self, AddressError> {
        Self::from_nitoo(identifier, 0)
    }

    /// Address one unit (1–15) of a Nitoo device, or the device itself with
    /// unit 0.
    ///
    /// # Errors
    /// [`AddressError::InvalidNitoo`] when either component is out of range.
    pub fn from_nitoo(identifier: u32, unit: u8) -> Result<Self, AddressError> {
        if identifier > NITOO_MAX_IDENTIFIER {
            return Err(AddressError::InvalidNitoo("identifier exceeds 24 bits"));
        }
        if unit > 15 {
            return Err(AddressError::InvalidNitoo("unit exceeds 15"));
        }
        let packed = u64::from(identifier) * 16 + u64::from(unit);
        let kind = if unit == 0 {
            AddressKind::NitooDevice
        } else {
            AddressKind::NitooUnit
        };
        Ok(Self {
            kind,
            value: packed.to_string(),
            parameters: Vec::new(),
        })
    }

    /// Recover `(identifier, unit)` from a Nitoo address.
    ///
    /// # Errors
    /// [`AddressError::Invalid`] on non-Nitoo shapes.
    pub fn to_nitoo(&self) -> Result<(u32, u8), AddressError> {
        match self.kind {
            AddressKind::NitooDevice | AddressKind::NitooUnit => {}
            _ => return Err(AddressError::Invalid("not a Nitoo address")),
        }
        let packed: u64 = self
            .value
            .parse()
            .map_err(|_| AddressError::InvalidNitoo("value overflows"))?;
        let identifier = u32::try_from(packed / 16)
            .map_err(|_| AddressError::InvalidNitoo("identifier exceeds 24 bits"))?;
        #[allow(clippy::cast_possible_truncation, reason = "mod 16 fits u8")]
        let unit = (packed % 16) as u8;
        Ok((identifier, unit))
    }

    /// Address every SCS light point.
    #[must_use]
    pub fn scs_general() -> Self {
        Self {
            kind: AddressKind::ScsGeneral,
            value: "0".to_owned(),
            parameters: Vec::new(),
        }
    }

    /// Address every light point of one SCS area (0–10).
    ///
    /// # Errors
    /// [`AddressError::InvalidScs`] if `area` exceeds 10.
    pub fn scs_area(area: u8) -> Result<Self, AddressError> {
        if area > 10 {
            return Err(AddressError::InvalidScs("area exceeds 10"));
        }
        // Area 0 is written "00"; a bare "0" means general.
        let value = if area == 0 { "00".to_owned() } else { area.to_string() };
        Ok(Self {
            kind: AddressKind::ScsArea,
            value,
            parameters: Vec::new(),
        })
    }

    /// Address a named SCS group (1–255).
    ///
    /// # Errors
    /// [`AddressError::InvalidScs`] if `group` is zero.
    pub fn scs_group(group: u8) -> Result<Self, AddressError> {
        if group == 0 {
            return Err(AddressError::InvalidScs("group must be positive"));
        }
        Ok(Self {
            kind: AddressKind::ScsGroup,
            value: group.to_string(),
            parameters: Vec::new(),
        })
    }

    /// Address one SCS light point: area 0–10, point 1–15, bus extension
    /// 0–15 (0 meaning the local bus).
    ///
    /// # Errors
    /// [`AddressError::InvalidScs`] when a component is out of range.
    pub fn from_scs_point(area: u8, point: u8, extension: u8) -> Result<Self, AddressError> {
        if area > 10 {
            return Err(AddressError::InvalidScs("area exceeds 10"));
        }
        if point == 0 || point > 15 {
            return Err(AddressError::InvalidScs("point outside 1-15"));
        }
        if extension > 15 {
            return Err(AddressError::InvalidScs("extension exceeds 15"));
        }
        let value = if area <= 9 && point <= 9 {
            format!("{area}{point}")
        } else {
            format!("{area:02}{point:02}")
        };
        let parameters = if extension == 0 {
            Vec::new()
        } else {
            vec!["4".to_owned(), extension.to_string()]
        };
        Ok(Self {
            kind: AddressKind::ScsPointToPoint,
            value,
            parameters,
        })
    }

    /// Recover `(area, point, extension)` from an SCS point-to-point
    /// address.
    ///
    /// # Errors
    /// [`AddressError::Invalid`] on other shapes,
    /// [`AddressError::InvalidScs`] when the stored digits are not a valid
    /// point encoding.
    pub fn to_scs_point(&self) -> Result<(u8, u8, u8), AddressError> {
        if self.kind != AddressKind::ScsPointToPoint {
            return Err(AddressError::Invalid("not an SCS point-to-point address"));
        }
        let (area, point) = split_scs_point(&self.value)?;
        let extension = match self.parameters.as_slice() {
            [] => 0,
            [kind, ext] if kind == "4" => ext
                .parse::<u8>()
                .ok()
                .filter(|e| *e <= 15)
                .ok_or(AddressError::InvalidScs("extension exceeds 15"))?,
            _ => return Err(AddressError::InvalidScs("unrecognised extension parameters")),
        };
        Ok((area, point, extension))
    }

    /// Address every unit of every Zigbee device.
    #[must_use]
    pub fn zigbee_all_devices_all_units() -> Self {
        Self {
            kind: AddressKind::ZigbeeAllDevicesAllUnits,
            value: "00".to_owned(),
            parameters: Vec::new(),
        }
    }

    /// Address one unit number (1–99) on every Zigbee device.
    ///
    /// # Errors
    /// [`AddressError::InvalidZigbee`] when `unit` is 0 or exceeds 99.
    pub fn zigbee_all_devices_unit(unit: u8) -> Result<Self, AddressError> {
        if unit == 0 || unit > 99 {
            return Err(AddressError::InvalidZigbee("unit outside 1-99"));
        }
        Ok(Self {
            kind: AddressKind::ZigbeeAllDevicesSpecificUnit,
            value: format!("{unit:02}"),
            parameters: Vec::new(),
        })
    }

    /// Address a Zigbee device: unit 1–99 targets one unit, unit 0 targets
    /// every unit of the device.
    ///
    /// # Errors
    /// [`AddressError::InvalidZigbee`] when `unit` exceeds 99.
    pub fn from_zigbee(device: u32, unit: u8) -> Result<Self, AddressError> {
        if unit > 99 {
            return Err(AddressError::InvalidZigbee("unit exceeds 99"));
        }
        let kind = if unit == 0 {
            AddressKind::ZigbeeSpecificDeviceAllUnits
        } else {
            AddressKind::ZigbeeSpecificDeviceSpecificUnit
        };
        Ok(Self {
            kind,
            value: format!("{device}{unit:02}"),
            parameters: Vec::new(),
        })
    }

    /// Recover `(device, unit)` from a specific-device Zigbee address
    /// (unit 0 meaning all units).
    ///
    /// # Errors
    /// [`AddressError::Invalid`] on other shapes,
    /// [`AddressError::InvalidZigbee`] when the stored digits overflow.
    pub fn to_zigbee(&self) -> Result<(u32, u8), AddressError> {
        match self.kind {
            AddressKind::ZigbeeSpecificDeviceAllUnits
            | AddressKind::ZigbeeSpecificDeviceSpecificUnit => {}
            _ => return Err(AddressError::Invalid("not a specific Zigbee device")),
        }
        let split = self.value.len().saturating_sub(2);
        let device = self.value[..split]
            .parse()
            .map_err(|_| AddressError::InvalidZigbee("device overflows"))?;
        let unit = self.value[split..]
            .parse()
            .map_err(|_| AddressError::InvalidZigbee("unit digits"))?;
        Ok((device, unit))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)?;
        for p in &self.parameters {
            write!(f, "#{p}")?;
        }
        Ok(())
    }
}

/// Split a WHERE value into `(area, point)` for point-to-point addressing:
/// two digits `AP` for single-digit components, four digits `AAPP`
/// otherwise.
fn split_scs_point(value: &str) -> Result<(u8, u8), AddressError> {
    let (area, point) = match value.len() {
        2 => (&value[..1], &value[1..]),
        4 => (&value[..2], &value[2..]),
        _ => return Err(AddressError::InvalidScs("point value length")),
    };
    let area: u8 = area
        .parse()
        .map_err(|_| AddressError::InvalidScs("area digits"))?;
    let point: u8 = point
        .parse()
        .map_err(|_| AddressError::InvalidScs("point digits"))?;
    if area > 10 || point == 0 || point > 15 {
        return Err(AddressError::InvalidScs("area or point out of range"));
    }
    Ok((area, point))
}

/// Mode, medium and address recovered from a WHERE field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WhereParts {
    pub address: Option<Address>,
    pub mode: Option<Mode>,
    pub medium: Option<Medium>,
}

impl WhereParts {
    const EMPTY: Self = Self {
        address: None,
        mode: None,
        medium: None,
    };
}

/// Decode a WHERE field into address, mode and medium per protocol.
pub(crate) fn decode_where(
    protocol: Protocol,
    field: &Field,
) -> Result<WhereParts, AddressError> {
    if field.is_blank() {
        return Ok(WhereParts::EMPTY);
    }
    let params: Vec<&str> = field.parameters().iter().map(Parameter::as_str).collect();
    match protocol {
        Protocol::Scs => decode_scs_where(&params),
        Protocol::Zigbee => decode_zigbee_where(&params),
        Protocol::Nitoo => decode_nitoo_where(&params),
    }
}

fn decode_scs_where(params: &[&str]) -> Result<WhereParts, AddressError> {
    let first = params.first().copied().unwrap_or_default();
    let address = if first == "0" {
        Address::scs_general()
    } else if first.is_empty() {
        let group = params
            .get(1)
            .and_then(|g| g.parse().ok())
            .ok_or(AddressError::InvalidScs("group digits"))?;
        Address::scs_group(group)?
    } else if first == "00"
        || (!first.starts_with('0') && matches!(first.parse::<u8>(), Ok(1..=10)))
    {
        let area = if first == "00" {
            0
        } else {
            first
                .parse()
                .map_err(|_| AddressError::InvalidScs("area digits"))?
        };
        Address::scs_area(area)?
    } else {
        let (area, point) = split_scs_point(first)?;
        let extension = match params.get(1..) {
            None | Some([]) => 0,
            Some([kind, ext]) if *kind == "4" => ext
                .parse::<u8>()
                .ok()
                .filter(|e| *e <= 15)
                .ok_or(AddressError::InvalidScs("extension exceeds 15"))?,
            Some(_) => return Err(AddressError::InvalidScs("unrecognised extension parameters")),
        };
        Address::from_scs_point(area, point, extension)?
    };
    Ok(WhereParts {
        address: Some(address),
        mode: None,
        medium: Some(Medium::Bus),
    })
}

fn zigbee_address_from_value(value: &str) -> Result<Address, AddressError> {
    if !value.bytes().all(|b| b.is_ascii_digit()) || value.is_empty() {
        return Err(AddressError::InvalidZigbee("address digits"));
    }
    let address = if value == "00" {
        Address::zigbee_all_devices_all_units()
    } else if value.len() <= 2 {
        let unit = value
            .parse()
            .map_err(|_| AddressError::InvalidZigbee("unit digits"))?;
        Address::zigbee_all_devices_unit(unit)?
    } else {
        // Keep the wire digits verbatim so leading zeros survive round-trips.
        let kind = if value.ends_with("00") {
            AddressKind::ZigbeeSpecificDeviceAllUnits
        } else {
            AddressKind::ZigbeeSpecificDeviceSpecificUnit
        };
        Address {
            kind,
            value: value.to_owned(),
            parameters: Vec::new(),
        }
    };
    Ok(address)
}

fn decode_zigbee_where(params: &[&str]) -> Result<WhereParts, AddressError> {
    let (mode, value, family) = match params {
        ["0", value, family] => (Some(Mode::Broadcast), *value, *family),
        ["", value, family] => (Some(Mode::Multicast), *value, *family),
        [value, family] => (Some(Mode::Unicast), *value, *family),
        _ => return Err(AddressError::InvalidZigbee("unrecognised WHERE shape")),
    };
    if family != "9" {
        return Err(AddressError::InvalidZigbee("family must be 9"));
    }
    Ok(WhereParts {
        address: Some(zigbee_address_from_value(value)?),
        mode,
        medium: Some(Medium::Radio),
    })
}

fn nitoo_medium(family: Option<&str>) -> Result<Medium, AddressError> {
    match family {
        None | Some("0") => Ok(Medium::Powerline),
        Some("1") => Ok(Medium::Radio),
        Some("2") => Ok(Medium::Infrared),
        Some(_) => Err(AddressError::InvalidNitoo("unrecognised family")),
    }
}

fn decode_nitoo_where(params: &[&str]) -> Result<WhereParts, AddressError> {
    let (mode, value, family) = match params {
        ["0", value] => (Some(Mode::Broadcast), *value, None),
        ["0", value, family] => (Some(Mode::Broadcast), *value, Some(*family)),
        ["", value] => (Some(Mode::Multicast), *value, None),
        ["", value, family] => (Some(Mode::Multicast), *value, Some(*family)),
        [value] => (Some(Mode::Unicast), *value, None),
        [value, family] => (Some(Mode::Unicast), *value, Some(*family)),
        _ => return Err(AddressError::InvalidNitoo("unrecognised WHERE shape")),
    };
    let packed: u64 = value
        .parse()
        .map_err(|_| AddressError::InvalidNitoo("value digits"))?;
    let identifier = u32::try_from(packed / 16)
        .map_err(|_| AddressError::InvalidNitoo("identifier exceeds 24 bits"))?;
    #[allow(clippy::cast_possible_truncation, reason = "mod 16 fits u8")]
    let unit = (packed % 16) as u8;
    Ok(WhereParts {
        address: Some(Address::from_nitoo(identifier, unit)?),
        mode,
        medium: Some(nitoo_medium(family)?),
    })
}

/// Encode address, mode and medium into a WHERE field per protocol.
///
/// With no address the field is blank. SCS carries no mode and always rides
/// the wired bus; Zigbee always appends family `9`; Nitoo appends the family
/// digit only when a medium was given.
pub(crate) fn encode_where(
    protocol: Protocol,
    address: Option<&Address>,
    mode: Option<Mode>,
    medium: Option<Medium>,
) -> Result<Field, FrameError> {
    let Some(address) = address else {
        return Field::new(vec![Parameter::empty()]);
    };
    let mut values: Vec<String> = Vec::new();
    match mode {
        Some(Mode::Broadcast) if protocol != Protocol::Scs => values.push("0".to_owned()),
        Some(Mode::Multicast) if protocol != Protocol::Scs => values.push(String::new()),
        _ => {}
    }
    // A group WHERE leads with the empty parameter that marks it as one.
    if protocol == Protocol::Scs && address.kind() == AddressKind::ScsGroup {
        values.push(String::new());
    }
    values.push(address.value().to_owned());
    match protocol {
        Protocol::Scs => values.extend(address.parameters().iter().cloned()),
        Protocol::Zigbee => values.push("9".to_owned()),
        Protocol::Nitoo => match medium {
            Some(Medium::Powerline) => values.push("0".to_owned()),
            Some(Medium::Radio) => values.push("1".to_owned()),
            Some(Medium::Infrared) => values.push("2".to_owned()),
            Some(Medium::Bus) | None => {}
        },
    }
    let parameters = values.into_iter().map(Parameter::new).collect::<Result<Vec<_>, _>>()?;
    Field::new(parameters)
}
