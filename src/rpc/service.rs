//! Service registration and method dispatch.
//!
//! Handlers are registered under `(service, method)` names with typed
//! request/response parameters; registration erases the types into a
//! [`Method`] that decodes the request payload, invokes the handler
//! synchronously, and encodes the response payload.

use std::collections::HashMap;
use std::fmt;

use super::wire::{Decode, DecodeError, Encode};

/// A dispatchable method: raw request bytes in, raw response bytes out.
pub trait Method: Send + Sync {
    fn invoke(&self, request: &[u8]) -> Result<Vec<u8>, InvokeError>;
}

/// Method invocation failure.
#[derive(Debug)]
pub enum InvokeError {
    /// The request payload did not decode; the caller treats this as stream
    /// corruption.
    Decode(DecodeError),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Decode(e) => write!(f, "request decode failed: {e}"),
        }
    }
}

impl std::error::Error for InvokeError {}

struct TypedMethod<Req, Resp, F> {
    handler: F,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> Method for TypedMethod<Req, Resp, F>
where
    Req: Decode,
    Resp: Encode,
    F: Fn(Req) -> Resp + Send + Sync,
{
    fn invoke(&self, request: &[u8]) -> Result<Vec<u8>, InvokeError> {
        let req = Req::decode(request).map_err(InvokeError::Decode)?;
        let resp = (self.handler)(req);
        Ok(resp.to_bytes())
    }
}

/// Name-keyed lookup table consulted by the server receive loop.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, HashMap<String, Box<dyn Method>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `service`/`method`, replacing any
    /// previous registration with the same names.
    pub fn register<Req, Resp, F>(&mut self, service: &str, method: &str, handler: F)
    where
        Req: Decode + 'static,
        Resp: Encode + 'static,
        F: Fn(Req) -> Resp + Send + Sync + 'static,
    {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(
                method.to_string(),
                Box::new(TypedMethod {
                    handler,
                    _marker: std::marker::PhantomData,
                }),
            );
    }

    /// Look up a method by name; `None` is a routing miss, not corruption.
    pub fn resolve(&self, service: &str, method: &str) -> Option<&dyn Method> {
        self.services
            .get(service)
            .and_then(|methods| methods.get(method))
            .map(|m| m.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_method_dispatches() {
        let mut registry = ServiceRegistry::new();
        registry.register("EchoService", "Echo", |req: String| format!("[Echo]{req}"));

        let method = registry.resolve("EchoService", "Echo").unwrap();
        let out = method.invoke(b"ping").unwrap();
        assert_eq!(out, b"[Echo]ping");
    }

    #[test]
    fn unknown_names_miss() {
        let mut registry = ServiceRegistry::new();
        registry.register("EchoService", "Echo", |req: String| req);
        assert!(registry.resolve("EchoService", "Nope").is_none());
        assert!(registry.resolve("Other", "Echo").is_none());
    }

    #[test]
    fn undecodable_request_is_an_error() {
        let mut registry = ServiceRegistry::new();
        registry.register("S", "m", |req: String| req);
        let method = registry.resolve("S", "m").unwrap();
        assert!(matches!(
            method.invoke(&[0xFF, 0xFE]),
            Err(InvokeError::Decode(_))
        ));
    }
}
