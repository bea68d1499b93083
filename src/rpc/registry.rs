//! Service registry - maps `"Service.Method"` to typed handlers.
//!
//! A method is any function of the shape
//!
//! ```text
//! fn(&S, A, &mut R) -> Result<(), E>
//! ```
//!
//! where `A` is decoded from the request body, `R` starts as `R::default()`
//! and is encoded into the response body, and `E` is rendered into
//! `Header.error`. The shape is checked by the compiler when the method is
//! added to a [`ServiceBuilder`]; names are checked by [`ServiceBuilder::build`].

use crate::rpc::codec::CodecType;
use crate::types::{Error, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Decoded argument of one request, typed by the method that decoded it.
pub type Argv = Box<dyn Any + Send>;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
    })
}

fn service_method_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$")
            .expect("service/method pattern is valid")
    })
}

/// Identifier starting with an uppercase ASCII letter.
fn is_exported(name: &str) -> bool {
    identifier_pattern().is_match(name) && name.starts_with(|c: char| c.is_ascii_uppercase())
}

/// `my_crate::module::Foo<T>` → `Foo`.
fn short_type_name<S>() -> &'static str {
    let full = type_name::<S>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

trait MethodHandler: Send + Sync {
    fn decode_argv(&self, codec: CodecType, body: &[u8]) -> Result<Argv>;
    fn invoke(&self, argv: Argv, codec: CodecType) -> Result<Vec<u8>>;
}

struct TypedMethod<S, A, R, E, F> {
    receiver: Arc<S>,
    func: F,
    _signature: PhantomData<fn(A) -> (R, E)>,
}

impl<S, A, R, E, F> MethodHandler for TypedMethod<S, A, R, E, F>
where
    S: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Default + 'static,
    E: fmt::Display + 'static,
    F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
{
    fn decode_argv(&self, codec: CodecType, body: &[u8]) -> Result<Argv> {
        let argv: A = codec.decode(body)?;
        Ok(Box::new(argv))
    }

    fn invoke(&self, argv: Argv, codec: CodecType) -> Result<Vec<u8>> {
        let argv = argv.downcast::<A>().map_err(|_| {
            Error::invocation(format!(
                "rpc server: argument is not of type {}",
                type_name::<A>()
            ))
        })?;
        // Vec/HashMap replies start out as empty containers.
        let mut reply = R::default();
        (self.func)(&self.receiver, *argv, &mut reply)
            .map_err(|e| Error::invocation(e.to_string()))?;
        codec.encode(&reply)
    }
}

/// One invocable method of a service.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: Box<dyn MethodHandler>,
}

impl fmt::Debug for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish_non_exhaustive()
    }
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of invocations so far.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode a request body into a fresh argument of this method's type.
    pub fn new_argv(&self, codec: CodecType, body: &[u8]) -> Result<Argv> {
        self.handler.decode_argv(codec, body)
    }

    /// Invoke the method and return the encoded reply.
    ///
    /// The call counter is bumped before the method runs, whatever the outcome.
    pub fn call(&self, argv: Argv, codec: CodecType) -> Result<Vec<u8>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        self.handler.invoke(argv, codec)
    }
}

/// A registered receiver and its methods. Immutable once built.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start a service named after the receiver's type.
    pub fn builder<S: Send + Sync + 'static>(receiver: S) -> ServiceBuilder<S> {
        Self::named(short_type_name::<S>(), receiver)
    }

    /// Start a service with an explicit name.
    pub fn named<S: Send + Sync + 'static>(
        name: impl Into<String>,
        receiver: S,
    ) -> ServiceBuilder<S> {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodType>> {
        self.methods.values()
    }
}

/// Collects methods for one receiver.
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, Arc<MethodType>>,
    errors: Vec<String>,
}

impl<S> fmt::Debug for ServiceBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Add a method.
    pub fn method<A, R, E, F>(mut self, name: &str, func: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + 'static,
        E: fmt::Display + 'static,
        F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            self.errors.push(format!(
                "rpc server: {}.{} is not a valid method name",
                self.name, name
            ));
            return self;
        }
        if self.methods.contains_key(name) {
            self.errors.push(format!(
                "rpc server: method {}.{} defined twice",
                self.name, name
            ));
            return self;
        }

        let method = MethodType {
            name: name.to_string(),
            arg_type: type_name::<A>(),
            reply_type: type_name::<R>(),
            num_calls: AtomicU64::new(0),
            handler: Box::new(TypedMethod {
                receiver: self.receiver.clone(),
                func,
                _signature: PhantomData,
            }),
        };
        tracing::debug!("rpc server: register {}.{}", self.name, name);
        self.methods.insert(name.to_string(), Arc::new(method));
        self
    }

    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(Error::registration(format!(
                "rpc server: {} is not a valid service name",
                self.name
            )));
        }
        if let Some(err) = self.errors.into_iter().next() {
            return Err(Error::registration(err));
        }
        if self.methods.is_empty() {
            return Err(Error::registration(format!(
                "rpc server: type {} has no methods of suitable type",
                self.name
            )));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// All services exposed by one server.
#[derive(Debug, Default)]
pub struct Registry {
    services: HashMap<String, Arc<Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Service) -> Result<()> {
        if self.services.contains_key(service.name()) {
            return Err(Error::registration(format!(
                "rpc: service already defined: {}",
                service.name()
            )));
        }
        tracing::info!(
            "rpc server: registered service {} ({} methods)",
            service.name(),
            service.methods.len()
        );
        self.services
            .insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    /// Resolve `"Service.Method"`.
    pub fn find(&self, service_method: &str) -> Result<Arc<MethodType>> {
        let ill_formed = || {
            Error::invocation(format!(
                "rpc server: service/method request ill-formed: {}",
                service_method
            ))
        };
        if !service_method_pattern().is_match(service_method) {
            return Err(ill_formed());
        }
        let (service_name, method_name) = service_method.split_once('.').ok_or_else(ill_formed)?;

        let service = self.services.get(service_name).ok_or_else(|| {
            Error::invocation(format!("rpc server: can't find service {}", service_name))
        })?;
        service.method(method_name).cloned().ok_or_else(|| {
            Error::invocation(format!("rpc server: can't find method {}", method_name))
        })
    }
}
