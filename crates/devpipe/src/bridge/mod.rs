//! Wire layer between this client and the browser's debugging pipes.
//!
//! # Architecture
//!
//! - **codec**: NUL-delimited framing for AsyncRead/AsyncWrite
//! - **protocol**: Request/response/event shapes and inbound classification
//! - **transport**: Reader task plus serialized writer over one pipe pair

pub mod codec;
pub mod protocol;
pub mod transport;
