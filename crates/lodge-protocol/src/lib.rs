//! Wire protocol between the lodge supervisor and its per-user workers.
//!
//! The protocol is newline-delimited JSON over a Unix domain socket, one
//! request per connection:
//!
//! ```text
//! supervisor -> worker   {"id":"...","method":"...","params":{...}}\n
//! worker -> supervisor   {"id":"...","result":...}\n
//!                        {"id":"...","error":"..."}\n
//! ```
//!
//! There is no length prefix. A response is complete once a full line parses
//! as an envelope; partial reads are buffered by [`LineBuffer`] until the
//! terminating newline arrives. JSON string escaping guarantees that embedded
//! newlines never split a frame, but very large payloads still travel as a
//! single line.

pub mod envelope;
pub mod framing;
pub mod methods;

pub use envelope::{ControlRequest, FrameError, Outcome, Request, Response};
pub use framing::{LineBuffer, encode_line};
