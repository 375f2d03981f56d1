//! Request decoding and routing to built-in or registered services.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::{task, time};

use crate::{
   array::ArrayService,
   error::QueryError,
   ipc::{Request, ServiceQuery},
   path::PathResolver,
   service::{QueryContext, Service, ServiceRegistry, ServiceReply},
   video::{VideoBackend, VideoService},
};

/// Payload returned by the `test` service.
pub const TEST_PAYLOAD: &[u8] = b"test-binary-payload";

/// Services handled in-process, routed before the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
   Test,
   Video,
   Array,
}

impl Builtin {
   pub fn from_name(name: &str) -> Option<Self> {
      match name {
         "test" => Some(Self::Test),
         "video" => Some(Self::Video),
         "array" => Some(Self::Array),
         _ => None,
      }
   }

   pub const fn name(self) -> &'static str {
      match self {
         Self::Test => "test",
         Self::Video => "video",
         Self::Array => "array",
      }
   }
}

/// Echo handler for connectivity checks
#[derive(Debug, Default, Clone, Copy)]
pub struct TestService;

impl Service for TestService {
   fn handle_query(&self, query: &Value, _ctx: &QueryContext<'_>) -> Result<ServiceReply, QueryError> {
      Ok(ServiceReply::new(json!({ "test_query": query }), TEST_PAYLOAD.to_vec()))
   }
}

/// What the connection writes back
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
   /// Result object (possibly a `success: false` failure) plus payload
   Result(ServiceReply),
   /// The request broke the framing contract
   FramingError(String),
}

/// `{"success": false, "error": ..., "kind": ...}` with an empty payload
pub fn failure_reply(err: &QueryError) -> ServiceReply {
   ServiceReply::result(json!({
      "success": false,
      "error": err.to_string(),
      "kind": err.kind(),
   }))
}

struct Handlers {
   paths:    PathResolver,
   registry: ServiceRegistry,
   test:     TestService,
   video:    VideoService,
   array:    ArrayService,
}

impl Handlers {
   fn run(&self, query: &ServiceQuery) -> Result<ServiceReply, QueryError> {
      let ctx = QueryContext {
         dir:     &query.dir,
         user_id: query.user_id.as_deref(),
         paths:   &self.paths,
      };

      match Builtin::from_name(&query.service_name) {
         Some(Builtin::Test) => self.test.handle_query(&query.query, &ctx),
         Some(Builtin::Video) => self.video.handle_query(&query.query, &ctx),
         Some(Builtin::Array) => self.array.handle_query(&query.query, &ctx),
         None => self
            .registry
            .dispatch(&query.service_name, &query.query, &ctx),
      }
   }
}

/// Shared, immutable request router
#[derive(Clone)]
pub struct Dispatcher {
   handlers: Arc<Handlers>,
   timeout:  Option<Duration>,
}

impl Dispatcher {
   pub fn new(paths: PathResolver, registry: ServiceRegistry, video: Arc<dyn VideoBackend>) -> Self {
      Self {
         handlers: Arc::new(Handlers {
            paths,
            registry,
            test: TestService,
            video: VideoService::new(video),
            array: ArrayService,
         }),
         timeout:  None,
      }
   }

   /// Bounds how long a connection waits for its handler. `None` waits forever.
   pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
      self.timeout = timeout;
      self
   }

   /// Decodes and answers one request body.
   pub async fn handle(&self, body: &[u8]) -> Reply {
      match Request::decode(body) {
         Ok(Request::ServiceQuery(query)) => Reply::Result(self.dispatch(query).await),
         Err(e) => {
            tracing::warn!("rejecting request: {e}");
            Reply::FramingError(e.to_string())
         },
      }
   }

   /// Runs a service query on the blocking pool. Handler failures, panics and
   /// timeouts all come back as a failure result.
   pub async fn dispatch(&self, query: ServiceQuery) -> ServiceReply {
      let name = query.service_name.clone();
      tracing::Span::current().record("service", name.as_str());
      tracing::debug!(service = %name, user = ?query.user_id, "service query");

      let handlers = Arc::clone(&self.handlers);
      let job = task::spawn_blocking(move || handlers.run(&query));

      let joined = match self.timeout {
         Some(limit) => match time::timeout(limit, job).await {
            Ok(joined) => joined,
            Err(_) => {
               let err = QueryError::handler(format!(
                  "service {name} did not finish within {}ms",
                  limit.as_millis()
               ));
               tracing::warn!("{err}");
               return failure_reply(&err);
            },
         },
         None => job.await,
      };

      let outcome = joined.unwrap_or_else(|e| {
         Err(QueryError::handler(if e.is_panic() {
            format!("service {name} panicked")
         } else {
            format!("service {name} was cancelled")
         }))
      });

      match outcome {
         Ok(reply) => reply,
         Err(err) => {
            tracing::info!(service = %name, kind = err.kind(), "query failed: {err}");
            failure_reply(&err)
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;
   use crate::{service::service_fn, video::UnavailableBackend};

   fn dispatcher(registry: ServiceRegistry) -> (TempDir, Dispatcher) {
      let tmp = TempDir::new().unwrap();
      let paths = PathResolver::new(tmp.path()).unwrap();
      (tmp, Dispatcher::new(paths, registry, Arc::new(UnavailableBackend)))
   }

   fn body(service: &str, query: Value) -> Vec<u8> {
      serde_json::to_vec(&Request::service_query(service, query, "", None)).unwrap()
   }

   #[tokio::test]
   async fn test_service_echoes_query() {
      let (_tmp, d) = dispatcher(ServiceRegistry::default());
      let reply = d.handle(&body("test", json!({"a": 1}))).await;
      let Reply::Result(reply) = reply else { panic!("expected result") };
      assert_eq!(reply.result, json!({"test_query": {"a": 1}}));
      assert_eq!(reply.payload, TEST_PAYLOAD);
   }

   #[tokio::test]
   async fn builtins_shadow_registered_services() {
      let mut builder = ServiceRegistry::builder();
      builder.register("test", service_fn(|_, _| Ok(ServiceReply::result(json!("shadow")))));
      let (_tmp, d) = dispatcher(builder.build());

      let Reply::Result(reply) = d.handle(&body("test", json!(null))).await else {
         panic!("expected result");
      };
      assert_eq!(reply.payload, TEST_PAYLOAD);
   }

   #[tokio::test]
   async fn unknown_service_is_a_failure_result() {
      let (_tmp, d) = dispatcher(ServiceRegistry::default());
      let Reply::Result(reply) = d.handle(&body("nope", json!({}))).await else {
         panic!("expected result");
      };
      assert_eq!(reply.result["success"], json!(false));
      assert_eq!(reply.result["kind"], json!("UnknownService"));
      assert!(reply.payload.is_empty());
   }

   #[tokio::test]
   async fn malformed_body_is_a_framing_error() {
      let (_tmp, d) = dispatcher(ServiceRegistry::default());
      assert!(matches!(d.handle(b"{not json").await, Reply::FramingError(_)));
   }

   #[tokio::test]
   async fn panicking_handler_becomes_failure() {
      let mut builder = ServiceRegistry::builder();
      builder.register("boom", service_fn(|_, _| panic!("kaboom")));
      let (_tmp, d) = dispatcher(builder.build());

      let Reply::Result(reply) = d.handle(&body("boom", json!({}))).await else {
         panic!("expected result");
      };
      assert_eq!(reply.result["kind"], json!("HandlerFailure"));
   }

   #[tokio::test]
   async fn slow_handler_times_out() {
      let mut builder = ServiceRegistry::builder();
      builder.register(
         "slow",
         service_fn(|_, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(ServiceReply::result(json!({})))
         }),
      );
      let (_tmp, d) = dispatcher(builder.build());
      let d = d.with_timeout(Some(Duration::from_millis(20)));

      let Reply::Result(reply) = d.handle(&body("slow", json!({}))).await else {
         panic!("expected result");
      };
      assert_eq!(reply.result["success"], json!(false));
   }
}
