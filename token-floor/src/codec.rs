//! Length-delimited postcard framing for floor messages.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::messages::FloorMessage;

/// Frames are tiny — a token scales with the roster, not with media — so a
/// small cap catches garbage early.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Codec pairing [`LengthDelimitedCodec`] framing with postcard
/// serialization of [`FloorMessage`], for use with
/// `tokio_util::codec::Framed` over any byte stream between two peers.
#[derive(Debug)]
pub struct FloorCodec<P> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<P>,
}

impl<P> FloorCodec<P> {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<P> Default for FloorCodec<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for FloorCodec<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<P: DeserializeOwned> Decoder for FloorCodec<P> {
    type Item = FloorMessage<P>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                let message = postcard::from_bytes(&frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl<P: Serialize> Encoder<FloorMessage<P>> for FloorCodec<P> {
    type Error = io::Error;

    fn encode(&mut self, item: FloorMessage<P>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}
