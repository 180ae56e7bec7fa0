use crate::{CompleteFrame, Frame, Gt06Error, END_SENTINEL, START_SENTINEL};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A Codec used to Encode/Decode [Frame]s from Streams and Sinks.
///
/// The decoder sweeps the input byte stream for the `78 78` start
/// sentinel, discards anything before it (including a stray `0D 0A`),
/// and pairs it with the next `0D 0A` end sentinel. The delimited
/// candidate is then validated by [Frame::decode]; candidates that fail
/// validation are yielded as [CompleteFrame::Invalid] so a spurious end
/// sentinel inside a payload costs one rejected frame without losing
/// stream sync.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

fn find_marker(source: &[u8], marker: [u8; 2]) -> Option<usize> {
    source.windows(marker.len()).position(|window| window == marker)
}

impl Decoder for FrameCodec {
    type Item = CompleteFrame;

    type Error = Gt06Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = match find_marker(src, START_SENTINEL) {
            Some(index) => index,
            None => {
                // There is no start sentinel in the current buffer but
                // keep the final byte in case a sentinel crosses buffer
                // boundaries.
                let len = src.remaining();
                if len > START_SENTINEL.len() - 1 {
                    src.advance(len - (START_SENTINEL.len() - 1));
                }
                // Return None to indicate more data is needed
                return Ok(None);
            }
        };
        if start > 0 {
            log::debug!("discarding {start} bytes before start sentinel");
            src.advance(start);
        }

        // Pair the start with the next end sentinel. The candidate spans
        // both sentinels inclusive.
        let end = match find_marker(&src[START_SENTINEL.len()..], END_SENTINEL) {
            Some(index) => START_SENTINEL.len() + index + END_SENTINEL.len(),
            // The frame has not fully arrived yet
            None => return Ok(None),
        };

        let candidate = src.split_to(end);
        Ok(Some(match Frame::decode(&candidate) {
            Ok(frame) => CompleteFrame::Valid(frame),
            Err(reason) => CompleteFrame::Invalid(reason),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Gt06Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.encode()?;

        dst.reserve(bytes.len());
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
