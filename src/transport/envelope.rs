//! Response envelope `{statusCode, result, message?, pagination?}`.

use serde_json::{Map, Value};

use crate::cache::Pagination;

/// Application status codes treated as success.
pub const SUCCESS_STATUSES: [u16; 3] = [200, 201, 204];

/// Stand-in for a `statusCode` that is present but not a status code.
pub const MALFORMED_STATUS: u16 = 0;

pub fn is_success(status: u16) -> bool {
  SUCCESS_STATUSES.contains(&status)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiEnvelope {
  pub status_code: Option<u16>,
  pub result: Value,
  pub message: Option<String>,
  pub pagination: Option<Pagination>,
}

impl ApiEnvelope {
  /// Parse a body leniently. Bodies that are not an envelope become its `result`.
  ///
  /// Each field is read on its own, so an odd `message` or `pagination` never
  /// costs the application status.
  pub fn from_body(body: Value) -> Self {
    let Value::Object(mut fields) = body else {
      return Self {
        result: body,
        ..Self::default()
      };
    };

    if !fields.contains_key("statusCode") && !fields.contains_key("result") {
      let message = fields.get("message").and_then(message_text);
      return Self {
        status_code: None,
        result: Value::Object(fields),
        message,
        pagination: None,
      };
    }

    Self {
      status_code: fields.get("statusCode").and_then(status_code),
      message: fields.get("message").and_then(message_text),
      pagination: fields.get("pagination").and_then(pagination),
      result: fields.remove("result").unwrap_or(Value::Null),
    }
  }

  /// The application status, falling back to the transport status.
  pub fn status(&self, transport_status: u16) -> u16 {
    self.status_code.unwrap_or(transport_status)
  }

  pub fn message_or_default(&self, status: u16) -> String {
    self
      .message
      .clone()
      .unwrap_or_else(|| format!("request failed with status {status}"))
  }
}

/// A number or a numeric string.
fn numeric(value: &Value) -> Option<u64> {
  match value {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

/// `null` means absent; anything else that is not a status code is malformed.
fn status_code(value: &Value) -> Option<u16> {
  if value.is_null() {
    return None;
  }
  Some(
    numeric(value)
      .and_then(|n| u16::try_from(n).ok())
      .unwrap_or(MALFORMED_STATUS),
  )
}

fn message_text(value: &Value) -> Option<String> {
  match value {
    Value::Null => None,
    Value::String(s) => Some(s.clone()),
    other => Some(other.to_string()),
  }
}

fn pagination(value: &Value) -> Option<Pagination> {
  let fields: &Map<String, Value> = value.as_object()?;
  let field = |name: &str| fields.get(name).and_then(numeric);
  Some(Pagination {
    page: field("page").unwrap_or(0),
    limit: field("limit").unwrap_or(0),
    total: field("total").or_else(|| field("totalCount")).unwrap_or(0),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parses_envelope() {
    let env = ApiEnvelope::from_body(json!({
      "statusCode": 200,
      "result": [{"_id": "a"}],
      "pagination": {"page": 1, "limit": 10, "totalCount": 31}
    }));
    assert_eq!(env.status(200), 200);
    assert_eq!(env.pagination.unwrap().total, 31);
    assert!(env.result.is_array());
  }

  #[test]
  fn test_embedded_error_under_http_200() {
    let env = ApiEnvelope::from_body(json!({"statusCode": 500, "message": "duplicate sku"}));
    assert_eq!(env.status(200), 500);
    assert!(!is_success(env.status(200)));
    assert_eq!(env.message_or_default(500), "duplicate sku");
  }

  #[test]
  fn test_bare_body_falls_back_to_transport_status() {
    let env = ApiEnvelope::from_body(json!({"message": "jwt expired"}));
    assert_eq!(env.status(401), 401);
    assert_eq!(env.message.as_deref(), Some("jwt expired"));
    assert!(ApiEnvelope::from_body(Value::Null).message.is_none());
  }

  #[test]
  fn test_object_message_keeps_error_status() {
    let env = ApiEnvelope::from_body(json!({"statusCode": 400, "message": {"name": "required"}}));
    assert_eq!(env.status(200), 400);
    assert_eq!(env.message.as_deref(), Some(r#"{"name":"required"}"#));
    assert!(env.result.is_null());
  }

  #[test]
  fn test_string_status_code() {
    let env = ApiEnvelope::from_body(json!({"statusCode": "422", "message": "bad input"}));
    assert_eq!(env.status(200), 422);

    let env = ApiEnvelope::from_body(json!({"statusCode": "oops", "result": {"_id": "a"}}));
    assert_eq!(env.status(200), MALFORMED_STATUS);
    assert!(!is_success(env.status(200)));
  }

  #[test]
  fn test_pagination_with_total_and_total_count() {
    let env = ApiEnvelope::from_body(json!({
      "statusCode": 200,
      "result": [],
      "pagination": {"page": "2", "limit": 5, "total": 7, "totalCount": 9}
    }));
    assert_eq!(env.status(200), 200);
    let pagination = env.pagination.unwrap();
    assert_eq!((pagination.page, pagination.limit, pagination.total), (2, 5, 7));
  }
}
