//! # API Models
//!
//! Request and response bodies of the REST API, kept apart from the
//! database records in [`crate::db`] so the wire format can add derived
//! fields (formatted reais, funding progress) without touching storage.
//!
//! - `requests.rs` - Incoming bodies and webhook field extraction
//! - `responses.rs` - The `ApiResponse` envelope and read models
//!
//! Field names are camelCase on the wire.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;
