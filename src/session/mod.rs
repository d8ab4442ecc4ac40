//! Session guard: credentials, auth-failure classification, refresh and replay.

mod classify;
mod guard;
mod tokens;

pub use classify::{Classification, Classifier};
pub use guard::{GuardState, SessionGuard, ACCESS_TOKEN_HEADER, AUTHORIZATION_HEADER, CSRF_HEADER};
pub use tokens::{MemoryTokenStore, SessionState, SqliteTokenStore, TokenStore};
