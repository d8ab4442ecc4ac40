//! Transport wrapper that attaches credentials and handles auth failures.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::event::{Notifier, SyncEvent};
use crate::routes::HttpMethod;
use crate::transport::{ApiEnvelope, HttpRequest, Transport};

use super::classify::{Classification, Classifier};
use super::tokens::{SessionState, TokenStore};

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";
pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
  Authenticated,
  Refreshing,
  LoggedOut,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResult {
  access_token: String,
  refresh_token: Option<String>,
  csrf_token: Option<String>,
}

/// Wraps every request with credentials and refresh-and-replay.
pub struct SessionGuard {
  transport: Arc<dyn Transport>,
  tokens: Arc<dyn TokenStore>,
  classifier: Classifier,
  refresh_endpoint: String,
  notifier: Notifier,
  session: RwLock<SessionState>,
  state: watch::Sender<GuardState>,
  /// Serializes refreshes so concurrent 401s trigger one refresh call
  refresh_lock: Mutex<()>,
}

impl SessionGuard {
  /// Build a guard, restoring any persisted session.
  pub fn new(
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
    classifier: Classifier,
    refresh_endpoint: impl Into<String>,
    notifier: Notifier,
  ) -> SyncResult<Self> {
    let session = tokens.load()?.unwrap_or_default();
    let initial = if session.access_token.is_some() {
      GuardState::Authenticated
    } else {
      GuardState::LoggedOut
    };
    let (state, _) = watch::channel(initial);

    Ok(Self {
      transport,
      tokens,
      classifier,
      refresh_endpoint: refresh_endpoint.into(),
      notifier,
      session: RwLock::new(session),
      state,
      refresh_lock: Mutex::new(()),
    })
  }

  pub fn state(&self) -> GuardState {
    *self.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<GuardState> {
    self.state.subscribe()
  }

  pub fn session(&self) -> SessionState {
    self
      .session
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn set_session(&self, session: SessionState) -> SyncResult<()> {
    self.tokens.save(&session)?;
    *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    Ok(())
  }

  pub fn login(&self, session: SessionState) -> SyncResult<()> {
    self.set_session(session)?;
    self.state.send_replace(GuardState::Authenticated);
    info!("session started");
    Ok(())
  }

  pub fn logout(&self) -> SyncResult<()> {
    *self.session.write().unwrap_or_else(PoisonError::into_inner) = SessionState::default();
    self.state.send_replace(GuardState::LoggedOut);
    self.tokens.clear()
  }

  /// Clear everything and tell the host to show its login screen.
  fn force_logout(&self, reason: &str) {
    let was = self.state.send_replace(GuardState::LoggedOut);
    *self.session.write().unwrap_or_else(PoisonError::into_inner) = SessionState::default();
    if let Err(e) = self.tokens.clear() {
      warn!(error = %e, "failed to clear persisted tokens");
    }
    if was != GuardState::LoggedOut {
      warn!(reason, "session ended");
      self.notifier.emit(SyncEvent::NavigateToLogin);
    }
  }

  /// Attach the current credentials. Returns the access token that was used.
  fn authorize(&self, mut request: HttpRequest) -> (Option<String>, HttpRequest) {
    let session = self.session();
    if let Some(token) = &session.access_token {
      request
        .headers
        .push((ACCESS_TOKEN_HEADER.to_string(), token.clone()));
      request
        .headers
        .push((AUTHORIZATION_HEADER.to_string(), format!("Bearer {token}")));
    }
    if let Some(csrf) = &session.csrf_token {
      request.headers.push((CSRF_HEADER.to_string(), csrf.clone()));
    }
    (session.access_token, request)
  }

  async fn send(&self, request: &HttpRequest) -> SyncResult<(Option<String>, u16, ApiEnvelope)> {
    let (token, request) = self.authorize(request.clone());
    let response = self.transport.send(request).await?;
    Ok((token, response.status, ApiEnvelope::from_body(response.body)))
  }

  /// Send `request`, refreshing the session and replaying once if it expired.
  pub async fn execute(&self, request: HttpRequest) -> SyncResult<ApiEnvelope> {
    let (sent_token, status, envelope) = self.send(&request).await?;
    match self.classifier.classify(status, &envelope) {
      Classification::Success => Ok(envelope),
      Classification::PermissionDenied(message) => Err(SyncError::PermissionDenied(message)),
      Classification::ApplicationError { status, message } => {
        Err(SyncError::Application { status, message })
      }
      Classification::SessionExpired => self.refresh_and_replay(request, sent_token).await,
    }
  }

  async fn refresh_and_replay(
    &self,
    request: HttpRequest,
    sent_token: Option<String>,
  ) -> SyncResult<ApiEnvelope> {
    {
      let _refreshing = self.refresh_lock.lock().await;
      let current = self.session().access_token;
      if current.is_some() && current != sent_token {
        debug!("session already refreshed by another request");
      } else {
        let Some(refresh_token) = self.session().refresh_token else {
          self.force_logout("no refresh token");
          return Err(SyncError::SessionExpired);
        };

        self.state.send_replace(GuardState::Refreshing);
        match self.refresh(&refresh_token).await {
          Ok(session) => {
            if let Err(e) = self.set_session(session) {
              warn!(error = %e, "could not store refreshed session");
              self.force_logout("refreshed session not stored");
              return Err(e);
            }
            self.state.send_replace(GuardState::Authenticated);
            self.notifier.emit(SyncEvent::SessionRefreshed);
            info!("session refreshed");
          }
          Err(e) => {
            debug!(error = %e, "refresh failed");
            self.force_logout("refresh failed");
            return Err(SyncError::SessionExpired);
          }
        }
      }
    }

    let (_, status, envelope) = self.send(&request).await?;
    match self.classifier.classify(status, &envelope) {
      Classification::Success => Ok(envelope),
      Classification::PermissionDenied(message) => Err(SyncError::PermissionDenied(message)),
      Classification::ApplicationError { status, message } => {
        Err(SyncError::Application { status, message })
      }
      Classification::SessionExpired => {
        self.force_logout("replay rejected after refresh");
        Err(SyncError::SessionExpired)
      }
    }
  }

  async fn refresh(&self, refresh_token: &str) -> SyncResult<SessionState> {
    let request = HttpRequest::new(HttpMethod::Post, self.refresh_endpoint.clone())
      .with_body(json!({ "refreshToken": refresh_token }));
    let response = self.transport.send(request).await?;
    let envelope = ApiEnvelope::from_body(response.body);

    match self.classifier.classify(response.status, &envelope) {
      Classification::Success => {
        let result: RefreshResult = serde_json::from_value(envelope.result)?;
        let previous = self.session();
        Ok(SessionState {
          access_token: Some(result.access_token),
          refresh_token: result.refresh_token.or(previous.refresh_token),
          csrf_token: result.csrf_token.or(previous.csrf_token),
        })
      }
      _ => Err(SyncError::SessionExpired),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::EventHandler;
  use crate::session::tokens::MemoryTokenStore;
  use crate::testing::MockTransport;
  use serde_json::json;

  const REFRESH: &str = "/auth/refresh";

  fn guard(
    transport: Arc<MockTransport>,
    session: Option<SessionState>,
  ) -> (SessionGuard, Arc<MemoryTokenStore>, EventHandler) {
    let tokens = Arc::new(MemoryTokenStore::default());
    if let Some(session) = session {
      tokens.save(&session).unwrap();
    }
    let (notifier, handler) = EventHandler::new();
    let classifier = Classifier::new(&["permission denied".into()], vec![401, 403]);
    let guard = SessionGuard::new(
      transport,
      tokens.clone(),
      classifier,
      REFRESH,
      notifier,
    )
    .unwrap();
    (guard, tokens, handler)
  }

  fn get(path: &str) -> HttpRequest {
    HttpRequest::new(HttpMethod::Get, path)
  }

  #[tokio::test]
  async fn test_attaches_all_headers() {
    let transport = MockTransport::new();
    transport.ok(HttpMethod::Get, "/product/a", json!({"_id": "a"}));
    let session = SessionState::new("acc", None).with_csrf("csrf");
    let (guard, _, _) = guard(transport.clone(), Some(session));

    guard.execute(get("/product/a")).await.unwrap();

    let sent = &transport.requests()[0];
    assert_eq!(sent.header("x-access-token"), Some("acc"));
    assert_eq!(sent.header("authorization"), Some("Bearer acc"));
    assert_eq!(sent.header("x-csrf-token"), Some("csrf"));
  }

  #[tokio::test]
  async fn test_refresh_then_single_replay() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/product/a", 401, json!({"message": "jwt expired"}));
    transport.ok(HttpMethod::Get, "/product/a", json!({"_id": "a", "name": "replayed"}));
    transport.ok(
      HttpMethod::Post,
      REFRESH,
      json!({"accessToken": "new-acc", "refreshToken": "new-ref"}),
    );
    let (guard, tokens, mut events) =
      guard(transport.clone(), Some(SessionState::new("old", Some("ref".into()))));

    let envelope = guard.execute(get("/product/a")).await.unwrap();

    assert_eq!(envelope.result["name"], "replayed");
    assert_eq!(transport.count(HttpMethod::Post, REFRESH), 1);
    assert_eq!(transport.count(HttpMethod::Get, "/product/a"), 2);
    assert_eq!(transport.requests()[1].body, Some(json!({"refreshToken": "ref"})));
    assert_eq!(transport.requests()[2].header("x-access-token"), Some("new-acc"));
    let stored = tokens.load().unwrap().unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("new-ref"));
    assert_eq!(guard.state(), GuardState::Authenticated);
    assert_eq!(events.drain(), vec![SyncEvent::SessionRefreshed]);
  }

  #[tokio::test]
  async fn test_refresh_failure_logs_out() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/product", 401, json!({"message": "expired"}));
    transport.respond(HttpMethod::Post, REFRESH, 401, json!({"message": "refresh expired"}));
    let (guard, tokens, mut events) =
      guard(transport.clone(), Some(SessionState::new("old", Some("ref".into()))));

    let err = guard.execute(get("/product")).await.unwrap_err();

    assert_eq!(err, SyncError::SessionExpired);
    assert_eq!(transport.count(HttpMethod::Get, "/product"), 1);
    assert_eq!(tokens.load().unwrap(), None);
    assert_eq!(guard.state(), GuardState::LoggedOut);
    assert_eq!(events.drain(), vec![SyncEvent::NavigateToLogin]);
  }

  #[tokio::test]
  async fn test_unreachable_refresh_endpoint_logs_out() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/product", 401, json!({"message": "expired"}));
    transport.fail(HttpMethod::Post, REFRESH, SyncError::Network("connection refused".into()));
    let (guard, tokens, mut events) =
      guard(transport.clone(), Some(SessionState::new("old", Some("ref".into()))));

    let err = guard.execute(get("/product")).await.unwrap_err();

    assert_eq!(err, SyncError::SessionExpired);
    assert_eq!(transport.count(HttpMethod::Get, "/product"), 1);
    assert_eq!(tokens.load().unwrap(), None);
    assert!(guard.session().is_empty());
    assert_eq!(guard.state(), GuardState::LoggedOut);
    assert_eq!(events.drain(), vec![SyncEvent::NavigateToLogin]);
  }

  /// Loads a session but refuses to persist anything.
  struct ReadOnlyTokenStore(SessionState);

  impl TokenStore for ReadOnlyTokenStore {
    fn load(&self) -> SyncResult<Option<SessionState>> {
      Ok(Some(self.0.clone()))
    }

    fn save(&self, _: &SessionState) -> SyncResult<()> {
      Err(SyncError::TokenStore("database is read-only".into()))
    }

    fn clear(&self) -> SyncResult<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_unsaved_refresh_does_not_stay_refreshing() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/product", 401, json!({"message": "expired"}));
    transport.ok(HttpMethod::Post, REFRESH, json!({"accessToken": "new"}));
    let tokens = Arc::new(ReadOnlyTokenStore(SessionState::new("old", Some("ref".into()))));
    let (notifier, mut events) = EventHandler::new();
    let guard = SessionGuard::new(
      transport.clone(),
      tokens,
      Classifier::new(&[], vec![401, 403]),
      REFRESH,
      notifier,
    )
    .unwrap();

    let err = guard.execute(get("/product")).await.unwrap_err();

    assert!(matches!(err, SyncError::TokenStore(_)));
    assert_eq!(guard.state(), GuardState::LoggedOut);
    assert!(guard.session().is_empty());
    assert_eq!(transport.count(HttpMethod::Get, "/product"), 1);
    assert_eq!(events.drain(), vec![SyncEvent::NavigateToLogin]);
  }

  #[tokio::test]
  async fn test_no_refresh_token_logs_out_immediately() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/product", 200, json!({"statusCode": 401}));
    let (guard, _, mut events) = guard(transport.clone(), Some(SessionState::new("old", None)));

    assert_eq!(
      guard.execute(get("/product")).await,
      Err(SyncError::SessionExpired)
    );
    assert_eq!(transport.count(HttpMethod::Post, REFRESH), 0);
    assert_eq!(events.drain(), vec![SyncEvent::NavigateToLogin]);
  }

  #[tokio::test]
  async fn test_permission_denied_keeps_session() {
    let transport = MockTransport::new();
    transport.respond(
      HttpMethod::Get,
      "/billing",
      401,
      json!({"statusCode": 401, "message": "Permission denied"}),
    );
    let session = SessionState::new("acc", Some("ref".into()));
    let (guard, tokens, mut events) = guard(transport.clone(), Some(session.clone()));

    let err = guard.execute(get("/billing")).await.unwrap_err();

    assert_eq!(err, SyncError::PermissionDenied("Permission denied".into()));
    assert_eq!(tokens.load().unwrap(), Some(session));
    assert_eq!(guard.state(), GuardState::Authenticated);
    assert_eq!(transport.count(HttpMethod::Post, REFRESH), 0);
    assert!(events.drain().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_expiry_refreshes_once() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/a", 401, json!({}));
    transport.ok(HttpMethod::Get, "/a", json!("a"));
    transport.respond(HttpMethod::Get, "/b", 401, json!({}));
    transport.ok(HttpMethod::Get, "/b", json!("b"));
    transport.ok(HttpMethod::Post, REFRESH, json!({"accessToken": "new"}));
    let (guard, _, _) = guard(transport.clone(), Some(SessionState::new("old", Some("ref".into()))));

    let (a, b) = tokio::join!(guard.execute(get("/a")), guard.execute(get("/b")));

    assert_eq!(a.unwrap().result, json!("a"));
    assert_eq!(b.unwrap().result, json!("b"));
    assert_eq!(transport.count(HttpMethod::Post, REFRESH), 1);
  }

  #[tokio::test]
  async fn test_application_error_is_returned() {
    let transport = MockTransport::new();
    transport.respond(
      HttpMethod::Post,
      "/product",
      200,
      json!({"statusCode": 422, "message": "sku exists"}),
    );
    let (guard, _, mut events) = guard(transport, Some(SessionState::new("acc", None)));

    let err = guard
      .execute(HttpRequest::new(HttpMethod::Post, "/product"))
      .await
      .unwrap_err();
    assert_eq!(
      err,
      SyncError::Application {
        status: 422,
        message: "sku exists".into()
      }
    );
    assert!(events.drain().is_empty());
  }
}
