//! HTTP fetching from worker contexts.
//!
//! Provides:
//! - **Client** (`client.rs`): a pooled blocking client built on `ureq`,
//!   the [`Transfer`] operation, and [`fetch`], which awaits a transfer
//!   from inside a worker
//! - **Request/Response** (`request.rs`): plain request and response values
//!
//! ## Error mapping
//!
//! | Outcome                         | `OperationError` |
//! |---------------------------------|------------------|
//! | non-2xx status                  | `Status`         |
//! | connect/read deadline exceeded  | `Timeout`        |
//! | DNS, refused, reset, bad URL    | `Transport`      |

pub mod client;
pub mod request;

pub use client::{fetch, HttpClient, Transfer};
pub use request::{HttpRequest, HttpResponse};
