//! Stream codec splitting a byte stream into whole OpenWebNet frames.
//!
//! The decoder discards bytes preceding a frame start so the first read after
//! connecting (or after a peer hiccup) is not poisoned by stale output, and
//! it always consumes through the terminator before reporting a parse error,
//! letting the caller's read loop resume at the next frame boundary.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, FrameError, MAX_FRAME_LEN};

/// [`Decoder`]/[`Encoder`] for [`Frame`] values.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

/// Position of the terminator `##` within `buf`, if present.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"##")
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // Drop noise ahead of the frame start.
        match src.iter().position(|&b| b == b'*') {
            Some(start) if start > 0 => src.advance(start),
            Some(_) => {}
            None => {
                src.clear();
                return Ok(None);
            }
        }
        let Some(end) = find_terminator(src) else {
            if src.len() > MAX_FRAME_LEN {
                src.clear();
                return Err(FrameError::Oversized);
            }
            return Ok(None);
        };
        let raw = src.split_to(end + 2);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| FrameError::NonDigitParameter)?;
        Frame::parse(text).map(Some)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.put_slice(frame.to_string().as_bytes());
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        Encoder::<&Frame>::encode(self, &frame, dst)
    }
}
