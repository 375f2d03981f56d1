//! Pluggable query handlers.
//!
//! A [`Service`] answers the `query` object of a `serviceQuery` request with a
//! result object and an optional binary payload. Externally contributed
//! services are collected in a [`ServiceRegistryBuilder`] during bootstrap and
//! frozen into a [`ServiceRegistry`] before the server accepts connections.

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::Value;

use crate::{
   error::{QueryError, RegistryError},
   path::PathResolver,
};

/// Per-request context handed to every handler
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
   /// Working directory used to expand `$dir` in references
   pub dir:     &'a str,
   /// Caller identity, only present when the front end supplied one
   pub user_id: Option<&'a str>,
   pub paths:   &'a PathResolver,
}

impl QueryContext<'_> {
   /// Resolves a reference against the shared root using this request's
   /// working directory.
   pub fn resolve(&self, reference: &str) -> Result<std::path::PathBuf, QueryError> {
      self.paths.resolve(reference, self.dir)
   }
}

/// Handler output: result object plus binary payload
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
   pub result:  Value,
   pub payload: Vec<u8>,
}

impl ServiceReply {
   pub const fn new(result: Value, payload: Vec<u8>) -> Self {
      Self { result, payload }
   }

   /// Result object with an empty payload
   pub const fn result(result: Value) -> Self {
      Self { result, payload: Vec::new() }
   }
}

/// A query handler. Implementations may block; they run on the blocking pool.
pub trait Service: Send + Sync {
   fn handle_query(&self, query: &Value, ctx: &QueryContext<'_>) -> Result<ServiceReply, QueryError>;
}

/// Wraps a closure as a shareable [`Service`]
pub fn service_fn<F>(f: F) -> Arc<dyn Service>
where
   F: Fn(&Value, &QueryContext<'_>) -> Result<ServiceReply, QueryError> + Send + Sync + 'static,
{
   Arc::new(f)
}

impl<F> Service for F
where
   F: Fn(&Value, &QueryContext<'_>) -> Result<ServiceReply, QueryError> + Send + Sync,
{
   fn handle_query(&self, query: &Value, ctx: &QueryContext<'_>) -> Result<ServiceReply, QueryError> {
      self(query, ctx)
   }
}

/// Collects registrations during bootstrap
#[derive(Default)]
pub struct ServiceRegistryBuilder {
   services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistryBuilder {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers `service` under `name`.
   ///
   /// A second registration under the same name replaces the first; the
   /// replaced handler is returned.
   pub fn register(
      &mut self,
      name: impl Into<String>,
      service: Arc<dyn Service>,
   ) -> Option<Arc<dyn Service>> {
      let name = name.into();
      warn_if_shadowed(&name);
      let previous = self.services.insert(name.clone(), service);
      if previous.is_some() {
         tracing::warn!("service {name} registered twice; keeping the latest handler");
      }
      previous
   }

   /// Registers `service` under `name`, refusing to replace an existing entry.
   pub fn register_unique(
      &mut self,
      name: impl Into<String>,
      service: Arc<dyn Service>,
   ) -> Result<(), RegistryError> {
      let name = name.into();
      if self.services.contains_key(&name) {
         return Err(RegistryError::DuplicateName(name));
      }
      warn_if_shadowed(&name);
      self.services.insert(name, service);
      Ok(())
   }

   pub fn build(self) -> ServiceRegistry {
      ServiceRegistry { services: self.services }
   }
}

fn warn_if_shadowed(name: &str) {
   if let Some(builtin) = crate::dispatch::Builtin::from_name(name) {
      tracing::warn!("service {name} is shadowed by the built-in {} handler", builtin.name());
   }
}

/// Immutable name → handler map shared by all connection workers
#[derive(Default, Clone)]
pub struct ServiceRegistry {
   services: HashMap<String, Arc<dyn Service>>,
}

impl fmt::Debug for ServiceRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut names: Vec<_> = self.services.keys().collect();
      names.sort();
      f.debug_struct("ServiceRegistry")
         .field("services", &names)
         .finish()
   }
}

impl ServiceRegistry {
   pub fn builder() -> ServiceRegistryBuilder {
      ServiceRegistryBuilder::new()
   }

   pub fn contains(&self, name: &str) -> bool {
      self.services.contains_key(name)
   }

   pub fn names(&self) -> impl Iterator<Item = &str> {
      self.services.keys().map(String::as_str)
   }

   /// Delegates to the handler registered under `name`
   pub fn dispatch(
      &self,
      name: &str,
      query: &Value,
      ctx: &QueryContext<'_>,
   ) -> Result<ServiceReply, QueryError> {
      let service = self
         .services
         .get(name)
         .ok_or_else(|| QueryError::UnknownService(name.to_string()))?;
      service.handle_query(query, ctx)
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;

   fn constant(tag: &'static str) -> Arc<dyn Service> {
      service_fn(move |_, _| Ok(ServiceReply::result(json!({ "tag": tag }))))
   }

   fn with_ctx<T>(f: impl FnOnce(&QueryContext<'_>) -> T) -> T {
      let tmp = TempDir::new().unwrap();
      let paths = PathResolver::new(tmp.path()).unwrap();
      let ctx = QueryContext { dir: "", user_id: None, paths: &paths };
      f(&ctx)
   }

   #[test]
   fn unknown_name_fails() {
      let registry = ServiceRegistry::builder().build();
      let err = with_ctx(|ctx| registry.dispatch("missing", &json!({}), ctx)).unwrap_err();
      assert_eq!(err, QueryError::UnknownService("missing".to_string()));
   }

   #[test]
   fn second_registration_wins() {
      let mut builder = ServiceRegistry::builder();
      assert!(builder.register("svc", constant("first")).is_none());
      assert!(builder.register("svc", constant("second")).is_some());
      let registry = builder.build();
      assert!(registry.contains("svc"));
      assert_eq!(registry.names().collect::<Vec<_>>(), vec!["svc"]);

      let reply = with_ctx(|ctx| registry.dispatch("svc", &json!({}), ctx)).unwrap();
      assert_eq!(reply.result, json!({"tag": "second"}));
   }

   #[test]
   fn register_unique_rejects_duplicates() {
      let mut builder = ServiceRegistry::builder();
      builder.register_unique("svc", constant("first")).unwrap();
      let err = builder.register_unique("svc", constant("second")).unwrap_err();
      assert_eq!(err, RegistryError::DuplicateName("svc".to_string()));

      let registry = builder.build();
      let reply = with_ctx(|ctx| registry.dispatch("svc", &json!({}), ctx)).unwrap();
      assert_eq!(reply.result, json!({"tag": "first"}));
   }

   #[test]
   fn user_id_reaches_handler_only_when_present() {
      let mut builder = ServiceRegistry::builder();
      builder.register(
         "who",
         service_fn(|_, ctx| Ok(ServiceReply::result(json!({ "user": ctx.user_id })))),
      );
      let registry = builder.build();

      let tmp = TempDir::new().unwrap();
      let paths = PathResolver::new(tmp.path()).unwrap();
      let anon = QueryContext { dir: "", user_id: None, paths: &paths };
      let named = QueryContext { user_id: Some("u7"), ..anon };

      assert_eq!(registry.dispatch("who", &json!({}), &anon).unwrap().result, json!({"user": null}));
      assert_eq!(registry.dispatch("who", &json!({}), &named).unwrap().result, json!({"user": "u7"}));
   }
}
