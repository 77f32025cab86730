//! Caller-supplied method bundles layered onto generated types.
//!
//! A mixin targets one or more type names (schema types or generic types).
//! `extend` adds methods that must not exist yet, `override_method` wraps a
//! method that must exist and receives the previous implementation as a
//! [`BoundMethod`], and `init` runs once for every new API object of a
//! matching type.

use super::api::{Api, MethodFn, MethodFuture, Reply};
use crate::error::Result;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Wrapper body for an overridden method.
pub type OverrideFn = Arc<dyn Fn(BoundMethod, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Hook run for each newly created API object.
pub type InitFn = Arc<dyn Fn(&Arc<Api>) + Send + Sync>;

/// The implementation an override replaces, bound to the called object.
#[derive(Clone)]
pub struct BoundMethod {
    api: Arc<Api>,
    original: MethodFn,
}

impl BoundMethod {
    pub(crate) fn new(api: Arc<Api>, original: MethodFn) -> Self {
        Self { api, original }
    }

    /// Invoke the wrapped implementation.
    pub fn call(&self, args: Vec<Value>) -> MethodFuture {
        (self.original)(self.api.clone(), args)
    }

    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }
}

/// A bundle of extensions, overrides and an init hook.
#[derive(Clone, Default)]
pub struct Mixin {
    pub(crate) types: Vec<String>,
    pub(crate) extend: Vec<(String, MethodFn)>,
    pub(crate) overrides: Vec<(String, OverrideFn)>,
    pub(crate) init: Option<InitFn>,
}

impl Mixin {
    /// Mixin applied to every listed type.
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Mixin applied to a single type.
    pub fn for_type(type_name: impl Into<String>) -> Self {
        Self::new([type_name.into()])
    }

    /// Add a new method.
    pub fn extend<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Arc<Api>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let method: MethodFn =
            Arc::new(move |api: Arc<Api>, args: Vec<Value>| method(api, args).boxed());
        self.extend.push((name.into(), method));
        self
    }

    /// Wrap an existing method.
    pub fn override_method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(BoundMethod, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let method: OverrideFn =
            Arc::new(move |base: BoundMethod, args: Vec<Value>| method(base, args).boxed());
        self.overrides.push((name.into(), method));
        self
    }

    /// Run `hook` for each API object created with a matching type.
    pub fn init(mut self, hook: impl Fn(&Arc<Api>) + Send + Sync + 'static) -> Self {
        self.init = Some(Arc::new(hook));
        self
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn applies_to(&self, type_name: &str) -> bool {
        self.types.iter().any(|t| t == type_name)
    }
}

impl std::fmt::Debug for Mixin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixin")
            .field("types", &self.types)
            .field("extend", &self.extend.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field(
                "overrides",
                &self.overrides.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("init", &self.init.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixin_builder() {
        let mixin = Mixin::new(["GenericObject", "sheet"])
            .extend("Describe", |_api, _args| async { Ok(Reply::Value(Value::Null)) })
            .override_method("GetLayout", |base, args| async move { base.call(args).await })
            .init(|_api| {});

        assert!(mixin.applies_to("sheet"));
        assert!(!mixin.applies_to("Doc"));
        assert_eq!(mixin.extend.len(), 1);
        assert_eq!(mixin.overrides.len(), 1);
        assert!(mixin.init.is_some());
        assert!(format!("{:?}", mixin).contains("Describe"));
    }
}
