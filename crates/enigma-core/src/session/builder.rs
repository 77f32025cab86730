//! Builder for configuring a Session.

use super::{RestoreMethods, Session};
use crate::config::{ObjectNotFoundPolicy, SessionOptions};
use crate::error::{EnigmaError, Result};
use crate::intercept::{Interceptors, RequestInterceptor, ResponseInterceptor};
use crate::schema::{Mixin, Schema, SchemaDocument};
use crate::transport::SocketFactory;
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring a [`Session`].
///
/// # Example
///
/// ```rust,ignore
/// use enigma_core::{Session, TcpSocketFactory};
///
/// let session = Session::builder()
///     .url("tcp://127.0.0.1:4848")
///     .schema(schema)
///     .socket_factory(TcpSocketFactory::new())
///     .suspend_on_close(true)
///     .build()?;
/// ```
pub struct SessionBuilder {
    url: Option<String>,
    schema: Option<SchemaDocument>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    mixins: Vec<Mixin>,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    options: SessionOptions,
    restore: RestoreMethods,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            schema: None,
            socket_factory: None,
            mixins: Vec::new(),
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            options: SessionOptions::default(),
            restore: RestoreMethods::default(),
        }
    }

    /// Engine URL handed to the socket factory. Required.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Engine schema document. Required.
    pub fn schema(mut self, schema: SchemaDocument) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Socket factory. Required.
    pub fn socket_factory(mut self, factory: impl SocketFactory + 'static) -> Self {
        self.socket_factory = Some(Arc::new(factory));
        self
    }

    /// Add a mixin. Mixins apply in the order they are added.
    pub fn mixin(mut self, mixin: Mixin) -> Self {
        self.mixins.push(mixin);
        self
    }

    /// Append a request-phase step after the built-in delta step.
    pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    /// Append a response-phase step after the built-in steps.
    pub fn response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
        self.response_interceptors.push(interceptor);
        self
    }

    /// Suspend instead of closing when the socket closes abnormally.
    ///
    /// Default: `false`
    pub fn suspend_on_close(mut self, enable: bool) -> Self {
        self.options.suspend_on_close = enable;
        self
    }

    /// Use the delta protocol for calls with a named output.
    ///
    /// Default: `true`
    pub fn delta(mut self, enable: bool) -> Self {
        self.options.protocol.delta = enable;
        self
    }

    /// What to do when the engine reports `qHandle: null, qType: null`.
    ///
    /// Default: [`ObjectNotFoundPolicy::Reject`]
    pub fn object_not_found(mut self, policy: ObjectNotFoundPolicy) -> Self {
        self.options.object_not_found = policy;
        self
    }

    /// How long resume waits for the engine's connected notification.
    ///
    /// Default: 5 seconds
    pub fn attach_timeout(mut self, timeout: Duration) -> Self {
        self.options.attach_timeout = timeout;
        self
    }

    /// Method sent for handles the engine lists under `suspend`.
    ///
    /// Default: `Resume`
    pub fn handle_resume_method(mut self, method: impl Into<String>) -> Self {
        self.options.handle_resume_method = method.into();
        self
    }

    /// Map a type to the method that fetches it by id on resume; `None`
    /// makes the type non-restorable.
    pub fn restore_method(mut self, type_name: impl Into<String>, method: Option<&str>) -> Self {
        self.restore = self.restore.with(type_name, method);
        self
    }

    /// Replace all plain options at once.
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the session. Mixins are validated here.
    pub fn build(self) -> Result<Session> {
        let url = self.url.ok_or_else(|| EnigmaError::Config {
            message: "Missing url".to_string(),
        })?;
        let document = self.schema.ok_or_else(|| EnigmaError::Config {
            message: "Missing schema".to_string(),
        })?;
        let factory = self.socket_factory.ok_or_else(|| EnigmaError::Config {
            message: "Missing socket factory".to_string(),
        })?;

        let schema = Schema::new(document, self.mixins)?;
        let interceptors =
            Interceptors::new(self.request_interceptors, self.response_interceptors);

        Ok(Session::new(
            url,
            factory,
            schema,
            self.options,
            interceptors,
            self.restore,
        ))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
