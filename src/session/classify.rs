//! Response classification.

use regex::Regex;

use crate::transport::{is_success, ApiEnvelope};

/// What a response means for the caller and the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
  Success,
  /// Known permission phrasing. Session stays as it is.
  PermissionDenied(String),
  /// Any other unauthorized signal.
  SessionExpired,
  ApplicationError { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct Classifier {
  patterns: Vec<Regex>,
  unauthorized: Vec<u16>,
}

impl Classifier {
  /// Patterns are case-insensitive regexes; anything that fails to compile is matched literally.
  pub fn new(patterns: &[String], unauthorized: Vec<u16>) -> Self {
    let patterns = patterns
      .iter()
      .filter_map(|p| {
        Regex::new(&format!("(?i){p}"))
          .or_else(|_| Regex::new(&format!("(?i){}", regex::escape(p))))
          .ok()
      })
      .collect();
    Self {
      patterns,
      unauthorized,
    }
  }

  pub fn is_permission_denied(&self, message: &str) -> bool {
    self.patterns.iter().any(|p| p.is_match(message))
  }

  /// Inspect both the transport status and the status embedded in the body.
  pub fn classify(&self, transport_status: u16, envelope: &ApiEnvelope) -> Classification {
    let app_status = envelope.status(transport_status);
    let transport_ok = (200..300).contains(&transport_status);
    if transport_ok && is_success(app_status) {
      return Classification::Success;
    }

    let status = if is_success(app_status) {
      transport_status
    } else {
      app_status
    };
    let message = envelope.message_or_default(status);

    if envelope
      .message
      .as_deref()
      .is_some_and(|m| self.is_permission_denied(m))
    {
      return Classification::PermissionDenied(message);
    }

    if self.unauthorized.contains(&transport_status) || self.unauthorized.contains(&app_status) {
      return Classification::SessionExpired;
    }

    Classification::ApplicationError { status, message }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn classifier() -> Classifier {
    Classifier::new(
      &["permission denied".into(), r"not authori[sz]ed to".into()],
      vec![401, 403],
    )
  }

  fn env(body: serde_json::Value) -> ApiEnvelope {
    ApiEnvelope::from_body(body)
  }

  #[test]
  fn test_success() {
    let c = classifier();
    assert_eq!(
      c.classify(200, &env(json!({"statusCode": 201, "result": {}}))),
      Classification::Success
    );
    assert_eq!(c.classify(204, &env(serde_json::Value::Null)), Classification::Success);
  }

  #[test]
  fn test_permission_denied_regardless_of_transport_status() {
    let c = classifier();
    for status in [200, 401, 403] {
      let e = env(json!({"statusCode": 403, "message": "Permission Denied for module Billing"}));
      assert!(matches!(
        c.classify(status, &e),
        Classification::PermissionDenied(_)
      ));
    }
    let e = env(json!({"statusCode": 401, "message": "You are not authorised to delete"}));
    assert!(matches!(c.classify(200, &e), Classification::PermissionDenied(_)));
  }

  #[test]
  fn test_embedded_unauthorized_is_session_expired() {
    let c = classifier();
    let e = env(json!({"statusCode": 401, "message": "jwt expired"}));
    assert_eq!(c.classify(200, &e), Classification::SessionExpired);
    assert_eq!(c.classify(401, &env(json!(null))), Classification::SessionExpired);
  }

  #[test]
  fn test_application_error_under_http_200() {
    let c = classifier();
    let e = env(json!({"statusCode": 409, "message": "duplicate code"}));
    assert_eq!(
      c.classify(200, &e),
      Classification::ApplicationError {
        status: 409,
        message: "duplicate code".into()
      }
    );
    assert_eq!(
      c.classify(502, &env(json!("Bad Gateway"))),
      Classification::ApplicationError {
        status: 502,
        message: "request failed with status 502".into()
      }
    );
  }

  #[test]
  fn test_invalid_pattern_matches_literally() {
    let c = Classifier::new(&["denied (".into()], vec![]);
    assert!(c.is_permission_denied("access denied (billing)"));
  }
}
