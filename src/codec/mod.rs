//! Codec module - wire encoding/decoding for call messages.
//!
//! The bridge speaks newline-delimited JSON over the companion's standard
//! streams: one request per line on the companion's input, one response per
//! line on its output. Both sides of the codec live here:
//!
//! - host side: [`encode_request`], [`decode_response`]
//! - companion side: [`decode_request`], [`encode_result`], [`encode_fault`]
//!
//! The companion-side half is what an entry script has to implement; the
//! `loopback` binary in this crate is its reference implementation.
//!
//! # Framing
//!
//! `serde_json` escapes control characters inside strings, so an encoded
//! message never contains a raw `\n` - a line is always exactly one message,
//! no matter what the payload holds.
//!
//! # Example
//!
//! ```
//! use sidecall::codec::{decode_response, encode_request};
//! use serde_json::json;
//!
//! let line = encode_request(1, "math.add", &[json!(2), json!(3)]).unwrap();
//! assert!(!line.contains('\n'));
//!
//! let response = decode_response(r#"{"id":1,"result":5}"#).unwrap();
//! assert_eq!(response.into_result().unwrap(), json!(5));
//! ```

mod line;

pub use line::{
    decode_request, decode_response, encode_fault, encode_request, encode_result, RemoteFault,
    Request, Response,
};
