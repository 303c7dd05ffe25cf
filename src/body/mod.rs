//! Incrementally written, incrementally read message bodies
//!
//! A [`StreamableBody`] is the only state shared between the task producing a
//! message payload and the task consuming it. The same type carries request
//! and response bodies for both HTTP/1.1 (chunked coding) and HTTP/2 (DATA
//! frames); the wire engines in [`crate::protocol`] only ever talk to it
//! through `write`, `close`, `fail` and `read_next`.

pub mod streamable;

pub use streamable::{BodyError, StreamableBody};
