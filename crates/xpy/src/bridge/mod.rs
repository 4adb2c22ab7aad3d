//! IPC bridge between the controller and its worker.
//!
//! # Architecture
//!
//! - **protocol**: frame types for both directions (`ToWorker`, `ToController`)
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: worker spawners and the streams they hand back

pub mod codec;
pub mod protocol;
pub mod transport;
