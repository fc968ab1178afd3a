// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error};
use tokio::sync::mpsc;

use crate::detection::SourceFrame;

// Producer of decoded frames for one pipeline instance. Media transport and
// decoding details live behind this; the pipeline only sees frames with
// capture timestamps. Returning None signals end of stream, after which the
// source is not polled again.
#[async_trait]
pub trait FrameSourceTrait {
    async fn next_frame(&mut self) -> Option<SourceFrame>;
}

/// Frame source fed through a bounded channel, e.g. by a network connection
/// handler. The stream ends once every sender has been dropped.
pub struct ChannelFrameSource {
    receiver: mpsc::Receiver<SourceFrame>,
}

impl ChannelFrameSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<SourceFrame>, ChannelFrameSource) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, ChannelFrameSource{receiver})
    }
}

#[async_trait]
impl FrameSourceTrait for ChannelFrameSource {
    async fn next_frame(&mut self) -> Option<SourceFrame> {
        self.receiver.recv().await
    }
}

/// Decodes an encoded (JPEG, PNG, ...) image into a frame.
pub fn decode_frame(data: &[u8], capture_ts: i64) -> Result<SourceFrame, CanonicalError> {
    if data.is_empty() {
        return Err(invalid_argument_error("empty image data"));
    }
    let image = image::load_from_memory(data).map_err(
        |e| invalid_argument_error(&format!("could not decode image: {}", e)))?;
    Ok(SourceFrame{
        image: image.to_rgb8(),
        capture_ts,
        encoded_len: data.len(),
    })
}

/// Splits a streamed frame message: an 8 byte big-endian capture timestamp
/// (ms since the Unix epoch) followed by the encoded image.
pub fn decode_framed_message(message: &[u8]) -> Result<SourceFrame, CanonicalError> {
    if message.len() <= 8 {
        return Err(invalid_argument_error(&format!(
            "frame message too short: {} bytes", message.len())));
    }
    let (ts_bytes, data) = message.split_at(8);
    let mut ts = [0_u8; 8];
    ts.copy_from_slice(ts_bytes);
    decode_frame(data, i64::from_be_bytes(ts))
}


#[cfg(test)]
mod tests {
    use canonical_error::CanonicalErrorCode;
    use image::RgbImage;
    use super::*;
    use super::test_util::encode_png;

    #[test]
    fn test_decode_frame() {
        let png = encode_png(&RgbImage::new(16, 8));
        let frame = decode_frame(&png, 1234).unwrap();
        assert_eq!(frame.image.dimensions(), (16, 8));
        assert_eq!(frame.capture_ts, 1234);
        assert_eq!(frame.encoded_len, png.len());
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_frame(b"definitely not an image", 0).err().unwrap();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
        let err = decode_frame(&[], 0).err().unwrap();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
    }

    #[test]
    fn test_decode_framed_message() {
        let mut message = 1_700_000_000_123_i64.to_be_bytes().to_vec();
        message.extend(encode_png(&RgbImage::new(4, 4)));
        let frame = decode_framed_message(&message).unwrap();
        assert_eq!(frame.capture_ts, 1_700_000_000_123);
        assert_eq!(frame.image.dimensions(), (4, 4));

        assert!(decode_framed_message(&[0; 8]).is_err());
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (sender, mut source) = ChannelFrameSource::new(2);
        let png = encode_png(&RgbImage::new(2, 2));
        sender.send(decode_frame(&png, 5).unwrap()).await.unwrap();
        drop(sender);
        assert_eq!(source.next_frame().await.unwrap().capture_ts, 5);
        assert!(source.next_frame().await.is_none());
    }

}  // mod tests.
