//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::error::{SyncError, SyncResult};
use crate::routes::HttpMethod;
use crate::transport::{HttpRequest, HttpResponse, Transport};

#[derive(Clone)]
struct Reply {
  result: SyncResult<HttpResponse>,
  /// Held until a permit is added
  hold: Option<Arc<Semaphore>>,
}

type Script = (HttpMethod, String, VecDeque<Reply>);

/// Replies from per-route queues. The last queued reply repeats.
///
/// A reply is picked when the request arrives, then any gates are awaited.
#[derive(Default)]
pub struct MockTransport {
  scripts: Mutex<Vec<Script>>,
  requests: Mutex<Vec<HttpRequest>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn push(&self, method: HttpMethod, path: &str, reply: Reply) {
    let mut scripts = self.scripts.lock().unwrap();
    match scripts
      .iter_mut()
      .find(|(m, p, _)| *m == method && p == path)
    {
      Some((_, _, queue)) => queue.push_back(reply),
      None => scripts.push((method, path.to_string(), VecDeque::from([reply]))),
    }
  }

  pub fn respond(&self, method: HttpMethod, path: &str, status: u16, body: Value) {
    self.push(
      method,
      path,
      Reply {
        result: Ok(HttpResponse { status, body }),
        hold: None,
      },
    );
  }

  /// Envelope reply with `statusCode` mirrored from the transport status.
  pub fn ok(&self, method: HttpMethod, path: &str, result: Value) {
    self.respond(method, path, 200, json!({"statusCode": 200, "result": result}));
  }

  /// Envelope reply held back until a permit is added to the returned semaphore.
  pub fn ok_held(&self, method: HttpMethod, path: &str, result: Value) -> Arc<Semaphore> {
    let hold = Arc::new(Semaphore::new(0));
    self.push(
      method,
      path,
      Reply {
        result: Ok(HttpResponse {
          status: 200,
          body: json!({"statusCode": 200, "result": result}),
        }),
        hold: Some(Arc::clone(&hold)),
      },
    );
    hold
  }

  pub fn fail(&self, method: HttpMethod, path: &str, error: SyncError) {
    self.push(
      method,
      path,
      Reply {
        result: Err(error),
        hold: None,
      },
    );
  }

  /// Hold every send until a permit is added to the returned semaphore.
  pub fn gate(&self) -> Arc<Semaphore> {
    let semaphore = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(Arc::clone(&semaphore));
    semaphore
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn count(&self, method: HttpMethod, path: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.path == path)
      .count()
  }

  fn next_reply(&self, request: &HttpRequest) -> Option<Reply> {
    let mut scripts = self.scripts.lock().unwrap();
    scripts
      .iter_mut()
      .find(|(m, p, _)| *m == request.method && *p == request.path)
      .and_then(|(_, _, queue)| {
        if queue.len() > 1 {
          queue.pop_front()
        } else {
          queue.front().cloned()
        }
      })
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
    self.requests.lock().unwrap().push(request.clone());
    let reply = self.next_reply(&request);

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }

    let Some(reply) = reply else {
      return Ok(HttpResponse {
        status: 404,
        body: json!({"statusCode": 404, "message": format!("no mock for {}", request.path)}),
      });
    };
    if let Some(hold) = &reply.hold {
      hold.acquire().await.unwrap().forget();
    }
    reply.result
  }
}
