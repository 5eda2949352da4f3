use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side will accept.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// Frames carry a big-endian u32 length prefix.
const LENGTH_FIELD_BYTES: usize = 4;

/// Length-delimited JSON frames over any byte stream.
pub struct JsonFrameCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonFrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonFrameCodec<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_BYTES)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonFrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                let item = serde_json::from_slice(&frame)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonFrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
