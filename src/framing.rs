//! Newline-delimited JSON framing shared by the server and the client.
//!
//! The decoder yields one complete document per frame as a `String`; turning
//! that document into an envelope happens at the call site, because whether a
//! malformed document is dropped or kills the connection depends on protocol
//! state, and a decoder error would poison the whole framed stream.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::IgnoredAny;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Upper bound on a single buffered frame. A peer that exceeds this without
/// ever sending a delimiter (and whose buffer is not one parseable document)
/// is cut off rather than buffered without limit.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds the {MAX_FRAME_LEN}-byte limit without a delimiter")]
    FrameTooLong,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for `\n`-terminated JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct Framer;

impl Decoder for Framer {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        while let Some(pos) = src.iter().position(|&byte| byte == b'\n') {
            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            match String::from_utf8(line.to_vec()) {
                Ok(text) => return Ok(Some(text)),
                Err(err) => {
                    debug!(%err, "dropping line that is not valid utf-8");
                    continue;
                }
            }
        }

        // Legacy peers may send a document without the trailing newline.
        // Consume the buffer as one frame if it already parses whole.
        let tail = src[..].trim_ascii();
        if !tail.is_empty() && serde_json::from_slice::<IgnoredAny>(tail).is_ok() {
            let text = String::from_utf8_lossy(tail).into_owned();
            src.clear();
            return Ok(Some(text));
        }

        if src.len() > MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLong);
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        let frame = self.decode(src)?;
        if frame.is_none() && !src.is_empty() {
            debug!(len = src.len(), "discarding unframed bytes at end of stream");
            src.clear();
        }
        Ok(frame)
    }
}

impl<T: Serialize> Encoder<&T> for Framer {
    type Error = FrameError;

    fn encode(&mut self, envelope: &T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let json = serde_json::to_vec(envelope)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
