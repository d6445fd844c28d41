//! Bidirectional Anthropic ⇄ Google format translation.
//!
//! Submodules: wire types ([`anthropic`], [`google`]), the request pipeline
//! ([`request`]), schema sanitation ([`schema`]), thinking recovery
//! ([`thinking`]), the signature cache ([`signature`]), and response/stream
//! conversion ([`response`], [`stream`]).

pub mod anthropic;
pub mod google;
pub mod request;
pub mod response;
pub mod schema;
pub mod signature;
pub mod stream;
pub mod thinking;

pub use request::convert_request;
pub use response::convert_response;
pub use signature::SignatureCache;
pub use stream::{accumulate_events, translate_stream, StreamError};
