//! HTTP transport.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::routes::HttpMethod;

/// A request ready to go on the wire (headers are added by the session guard).
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: HttpMethod,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
}

impl HttpRequest {
  pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      headers: Vec::new(),
    }
  }

  /// Attach `args` as a JSON body or query parameters depending on the verb.
  pub fn with_args(mut self, args: Value) -> Self {
    let empty = args.as_object().is_some_and(|o| o.is_empty());
    if self.method.carries_body() {
      self.body = Some(args);
    } else if !empty {
      if let Value::Object(map) = args {
        self.query = map
          .into_iter()
          .map(|(k, v)| {
            let v = match v {
              Value::String(s) => s,
              other => other.to_string(),
            };
            (k, v)
          })
          .collect();
      }
    }
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Value,
}

/// Sends requests. Errors mean no response was received at all.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

/// `reqwest`-backed transport against a base URL.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl ReqwestTransport {
  pub fn new(base_url: &str) -> SyncResult<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("invalid base url {base_url}: {e}")))?;
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| SyncError::Network(format!("failed to build http client: {e}")))?;
    Ok(Self { client, base_url })
  }

  fn url_for(&self, path: &str) -> SyncResult<Url> {
    let base = self.base_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{}/{}", base, path.trim_start_matches('/')))
      .map_err(|e| SyncError::Network(format!("invalid request path {path}: {e}")))
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
    let url = self.url_for(&request.path)?;
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| SyncError::Network(e.to_string()))?;
    debug!(method = %method, url = %url, "sending request");

    let mut builder = self.client.request(method, url).query(&request.query);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;
    let status = response.status().as_u16();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;
    let body = if bytes.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    Ok(HttpResponse { status, body })
  }
}
