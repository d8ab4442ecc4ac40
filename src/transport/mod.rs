//! Wire-level pieces: request/response types, the envelope, and the HTTP client.

mod envelope;
mod http;

pub use envelope::{is_success, ApiEnvelope, MALFORMED_STATUS, SUCCESS_STATUSES};
pub use http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
