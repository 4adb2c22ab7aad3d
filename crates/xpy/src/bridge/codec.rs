//! Length-prefixed JSON framing for bridge messages.
//!
//! Each frame is a 4-byte big-endian length followed by one serde_json document.
//! Works over any AsyncRead/AsyncWrite: in-memory duplex pipes, child stdio.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are reported at info level.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Typed codec: one direction of the bridge decodes `T`, the other encodes it.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Events from this target are never shipped as worker_log frames, otherwise
        // encoding a log frame would emit another log frame.
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        if json.len() > LARGE_FRAME_BYTES {
            tracing::info!(frame_kb = json.len() / 1024, "Large frame being encoded");
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        ExecOutcome, ExecPayload, FunctionReply, ToController, ToWorker,
    };

    #[test]
    fn decodes_what_it_encodes() {
        let mut codec = JsonCodec::<ToWorker>::new();
        let mut buf = BytesMut::new();

        let frame = ToWorker::Exec {
            id: 1,
            data: ExecPayload {
                code: "1 + 1".to_string(),
                context: Default::default(),
            },
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut encoder = JsonCodec::<ToController>::new();
        let mut full = BytesMut::new();
        encoder
            .encode(
                ToController::Exec {
                    id: 9,
                    data: ExecOutcome::failed("boom"),
                },
                &mut full,
            )
            .unwrap();

        let mut decoder = JsonCodec::<ToController>::new();
        let mut partial = full.split_to(full.len() - 3);
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let decoded = decoder.decode(&mut partial).unwrap().unwrap();
        assert!(matches!(decoded, ToController::Exec { id: 9, .. }));
    }

    #[test]
    fn several_frames_in_one_buffer() {
        let mut codec = JsonCodec::<ToWorker>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                ToWorker::FunctionCall {
                    id: 0,
                    data: FunctionReply::ok(serde_json::json!(42)),
                },
                &mut buf,
            )
            .unwrap();
        codec.encode(ToWorker::Shutdown, &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(ToWorker::FunctionCall { id: 0, .. })
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ToWorker::Shutdown));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"{not json"), &mut buf)
            .unwrap();

        let mut codec = JsonCodec::<ToWorker>::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
