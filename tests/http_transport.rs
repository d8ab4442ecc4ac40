use std::sync::Arc;

use crudsync::cache::QueryArgs;
use crudsync::config::Config;
use crudsync::event::{EventHandler, SyncEvent};
use crudsync::session::{GuardState, MemoryTokenStore, SessionState, TokenStore};
use crudsync::transport::ReqwestTransport;
use crudsync::{DataClient, SyncError};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, session: SessionState) -> (DataClient, EventHandler) {
  let config = Config::for_base_url(server.uri());
  let transport = Arc::new(ReqwestTransport::new(&server.uri()).unwrap());
  let tokens = Arc::new(MemoryTokenStore::default());
  tokens.save(&session).unwrap();
  DataClient::with_transport(&config, transport, tokens).unwrap()
}

// ── Credentials ─────────────────────────────────────────────────

#[tokio::test]
async fn requests_carry_session_headers() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/product/a"))
    .and(header("x-access-token", "acc"))
    .and(header("authorization", "Bearer acc"))
    .and(header("x-csrf-token", "csrf"))
    .respond_with(
      ResponseTemplate::new(200).set_body_json(json!({"statusCode": 200, "result": {"_id": "a"}})),
    )
    .expect(1)
    .mount(&server)
    .await;

  let (client, _) = client_for(&server, SessionState::new("acc", None).with_csrf("csrf"));
  let entry = client.fetch_by_id("Product", "a").await.unwrap();
  assert_eq!(entry.record(), Some(&json!({"_id": "a"})));
}

// ── Envelopes ───────────────────────────────────────────────────

#[tokio::test]
async fn list_sends_paging_in_body_and_reads_total_count() {
  let server = MockServer::start().await;
  Mock::given(method("PATCH"))
    .and(path("/product"))
    .and(body_json(json!({"pageNumber": 2, "pageLimit": 5})))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "statusCode": 200,
      "result": [{"_id": "f"}],
      "pagination": {"page": 2, "limit": 5, "totalCount": 6}
    })))
    .mount(&server)
    .await;

  let (client, _) = client_for(&server, SessionState::new("acc", None));
  let entry = client
    .fetch_list("Product", QueryArgs::page(2, 5))
    .await
    .unwrap();
  assert_eq!(entry.records().map(Vec::len), Some(1));
  assert_eq!(entry.pagination.map(|p| p.total), Some(6));
}

#[tokio::test]
async fn error_status_inside_http_200_is_an_application_error() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/product/a"))
    .respond_with(
      ResponseTemplate::new(200).set_body_json(json!({"statusCode": 422, "message": "bad input"})),
    )
    .mount(&server)
    .await;

  let (client, mut events) = client_for(&server, SessionState::new("acc", None));
  let err = client.fetch_by_id("Product", "a").await.unwrap_err();
  assert_eq!(
    err,
    SyncError::Application {
      status: 422,
      message: "bad input".into()
    }
  );
  assert!(matches!(events.drain().as_slice(), [SyncEvent::Error { .. }]));
}

#[tokio::test]
async fn permission_denied_keeps_session() {
  let server = MockServer::start().await;
  Mock::given(method("DELETE"))
    .and(path("/product/a"))
    .respond_with(ResponseTemplate::new(403).set_body_json(json!({
      "statusCode": 403,
      "message": "You are not authorized to delete products"
    })))
    .mount(&server)
    .await;

  let (client, mut events) = client_for(&server, SessionState::new("acc", Some("ref".into())));
  let err = client.delete("Product", "a").await.unwrap_err();
  assert!(matches!(err, SyncError::PermissionDenied(_)));
  assert_eq!(client.session_state(), GuardState::Authenticated);
  assert!(matches!(
    events.drain().as_slice(),
    [SyncEvent::PermissionDenied { .. }]
  ));
}

// ── Refresh and replay ──────────────────────────────────────────

#[tokio::test]
async fn expired_token_is_refreshed_and_request_replayed_once() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/product/a"))
    .and(header("x-access-token", "old"))
    .respond_with(
      ResponseTemplate::new(401).set_body_json(json!({"statusCode": 401, "message": "jwt expired"})),
    )
    .expect(1)
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path("/auth/refresh"))
    .and(body_json(json!({"refreshToken": "ref"})))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "statusCode": 200,
      "result": {"accessToken": "new", "refreshToken": "ref2"}
    })))
    .expect(1)
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/product/a"))
    .and(header("x-access-token", "new"))
    .respond_with(
      ResponseTemplate::new(200).set_body_json(json!({"statusCode": 200, "result": {"_id": "a"}})),
    )
    .expect(1)
    .mount(&server)
    .await;

  let (client, mut events) = client_for(&server, SessionState::new("old", Some("ref".into())));
  let entry = client.fetch_by_id("Product", "a").await.unwrap();

  assert_eq!(entry.record(), Some(&json!({"_id": "a"})));
  let session = client.session();
  assert_eq!(session.access_token.as_deref(), Some("new"));
  assert_eq!(session.refresh_token.as_deref(), Some("ref2"));
  assert_eq!(events.drain(), vec![SyncEvent::SessionRefreshed]);
}

#[tokio::test]
async fn rejected_refresh_logs_out() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/product/a"))
    .respond_with(
      ResponseTemplate::new(401).set_body_json(json!({"statusCode": 401, "message": "jwt expired"})),
    )
    .expect(1)
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path("/auth/refresh"))
    .respond_with(
      ResponseTemplate::new(401).set_body_json(json!({"statusCode": 401, "message": "invalid refresh"})),
    )
    .expect(1)
    .mount(&server)
    .await;

  let (client, mut events) = client_for(&server, SessionState::new("old", Some("ref".into())));
  let err = client.fetch_by_id("Product", "a").await.unwrap_err();

  assert_eq!(err, SyncError::SessionExpired);
  assert_eq!(client.session_state(), GuardState::LoggedOut);
  assert!(client.session().is_empty());
  assert_eq!(events.drain(), vec![SyncEvent::NavigateToLogin]);
}
