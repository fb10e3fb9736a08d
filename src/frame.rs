//! OpenWebNet frame model and character-level grammar.
//!
//! A frame is the ASCII byte sequence `*F1*F2*…*Fn##` where each field is a
//! `#`-separated list of decimal parameters. Parameters may be empty; a
//! leading empty parameter is how the protocol marks request frames (`*#WHO…`)
//! and dimension writes (`…*#DIM…`). [`Frame::parse`] and the `Display`
//! implementations are exact inverses for every well-formed frame.

use std::{fmt, str::FromStr};

use thiserror::Error;

pub mod codec;

/// Longest frame the stream decoder will buffer before giving up.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// Errors raised while parsing or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The byte sequence is not a frame (missing start or terminator).
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// A `##` sequence appeared inside the frame body.
    #[error("forbidden double hash inside frame body")]
    ForbiddenDoubleHash,
    /// A parameter contained a byte outside `0-9`.
    #[error("non-digit byte in parameter")]
    NonDigitParameter,
    /// More bytes accumulated than any valid frame may span.
    #[error("frame exceeds {MAX_FRAME_LEN} bytes without terminator")]
    Oversized,
    /// The underlying transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single protocol parameter: a possibly-empty run of ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Parameter(String);

impl Parameter {
    /// Create a parameter from a digit string.
    ///
    /// # Errors
    /// Returns [`FrameError::NonDigitParameter`] if `value` contains a byte
    /// outside `0-9`.
    pub fn new(value: impl Into<String>) -> Result<Self, FrameError> {
        let value = value.into();
        if value.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(value))
        } else {
            Err(FrameError::NonDigitParameter)
        }
    }

    /// The empty parameter.
    #[must_use]
    pub const fn empty() -> Self { Self(String::new()) }

    /// Whether this parameter carries no digits.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// The parameter's digit string.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// An ordered, non-empty sequence of parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    parameters: Vec<Parameter>,
}

impl Field {
    /// Create a field from its parameters.
    ///
    /// # Errors
    /// Returns [`FrameError::Malformed`] if `parameters` is empty.
    pub fn new(parameters: Vec<Parameter>) -> Result<Self, FrameError> {
        if parameters.is_empty() {
            return Err(FrameError::Malformed("field needs at least one parameter"));
        }
        Ok(Self { parameters })
    }

    /// Build a field from plain digit strings.
    ///
    /// # Errors
    /// Returns an error if any string is not digits-only or the slice is
    /// empty.
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> Result<Self, FrameError> {
        let parameters = values
            .iter()
            .map(|v| Parameter::new(v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parameters)
    }

    /// Single-parameter convenience constructor.
    ///
    /// # Errors
    /// Returns an error if `value` is not digits-only.
    pub fn single(value: impl Into<String>) -> Result<Self, FrameError> {
        Self::new(vec![Parameter::new(value)?])
    }

    /// The field's parameters, in order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] { &self.parameters }

    /// Whether the field is the single empty parameter (an empty WHERE).
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.parameters.len() == 1 && self.parameters[0].is_empty()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str("#")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

/// An ordered, non-empty sequence of fields with the canonical string form
/// `*F1*F2*…*Fn##`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    fields: Vec<Field>,
}

impl Frame {
    /// Create a frame from its fields.
    ///
    /// # Errors
    /// Returns [`FrameError::Malformed`] if `fields` is empty.
    pub fn new(fields: Vec<Field>) -> Result<Self, FrameError> {
        if fields.is_empty() {
            return Err(FrameError::Malformed("frame needs at least one field"));
        }
        Ok(Self { fields })
    }

    /// The frame's fields, in order.
    #[must_use]
    pub fn fields(&self) -> &[Field] { &self.fields }

    /// Parse a complete frame from its string form.
    ///
    /// Bytes before the first `*` are skipped so noise left over from a prior
    /// session does not poison the parse. The terminator `##` must close the
    /// input; an interior `##` is rejected, as is any non-digit parameter
    /// byte.
    ///
    /// # Errors
    /// [`FrameError::Malformed`] when no frame start or terminator is
    /// present, [`FrameError::ForbiddenDoubleHash`] for a `##` inside the
    /// body or a misplaced trailing `#`, and
    /// [`FrameError::NonDigitParameter`] for non-digit parameter bytes.
    pub fn parse(input: &str) -> Result<Self, FrameError> {
        let Some(start) = input.find('*') else {
            return Err(FrameError::Malformed("no frame start"));
        };
        let frame = &input[start..];
        let Some(body) = frame.strip_prefix('*').and_then(|f| f.strip_suffix("##")) else {
            return Err(FrameError::Malformed("no frame terminator"));
        };
        if body.contains("##") {
            return Err(FrameError::ForbiddenDoubleHash);
        }
        let mut fields = Vec::new();
        for (index, text) in body.split('*').enumerate() {
            fields.push(parse_field(index, text)?);
        }
        Self::new(fields)
    }

    /// Emit the canonical byte form of the frame.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> { self.to_string().into_bytes() }
}

/// Parse one field, enforcing where empty parameters may appear.
///
/// The tokeniser emits an empty parameter for every `#…#` run with nothing
/// between and a trailing empty parameter when the text ends on `#`. A
/// trailing empty parameter is only meaningful in the acknowledgement marker
/// (the bare `#` opening field of `*#*1##` and friends); anywhere else a `#`
/// that is not followed by a digit collides with the terminator grammar.
fn parse_field(index: usize, text: &str) -> Result<Field, FrameError> {
    let parameters = text
        .split('#')
        .map(Parameter::new)
        .collect::<Result<Vec<_>, _>>()?;
    let trailing_empty = parameters.len() > 1
        && parameters
            .last()
            .is_some_and(Parameter::is_empty);
    if trailing_empty && !(index == 0 && text == "#") {
        return Err(FrameError::ForbiddenDoubleHash);
    }
    Field::new(parameters)
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            write!(f, "*{field}")?;
        }
        f.write_str("##")
    }
}

impl FromStr for Frame {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}
