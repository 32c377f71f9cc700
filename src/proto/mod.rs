//! Message taxonomy and wire codec.
//!
//! Four message kinds cross node boundaries: requests and responses on the
//! lock-step reply channel, publications on the broadcast channel, and
//! updates on the pipeline channel. Each kind is a tagged enum with a `parse`
//! function returning the variant or a [`wire::WireError`], and a `prepare`
//! function producing the exact wire bytes.

pub mod pending;
pub mod publication;
pub mod request;
pub mod response;
pub mod update;
pub mod wire;


pub use pending::{Completion, PendingRequest};
pub use publication::{PreparedPublication, Publication, SharedPublication};
pub use request::Request;
pub use response::Response;
pub use update::Update;
pub use wire::WireError;
