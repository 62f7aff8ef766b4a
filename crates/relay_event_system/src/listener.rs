//! Listener seam between the bus and subscriber code.
//!
//! The bus stores type-erased [`EventListener`]s. The typed adapters in this
//! module bridge plain closures over a concrete [`Event`] type onto that
//! seam; the raw trait stays available for listeners that want the payload
//! bytes themselves (the remote-forwarding path does).

use crate::events::{Event, EventError};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Type-erased listener invoked by the bus with the serialized payload.
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    /// Handles one serialized event payload.
    async fn handle(&self, payload: &[u8]) -> Result<(), EventError>;

    /// Returns a human-readable name for this listener for logs.
    fn listener_name(&self) -> &str;
}

/// Type-safe wrapper adapting a sync closure over `T` onto the listener seam.
///
/// The payload is decoded back into `T` before the closure runs; a payload
/// that does not parse as `T` surfaces as a listener failure.
pub struct TypedListener<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    handler: F,
    name: String,
    _phantom: PhantomData<T>,
}

impl<T, F> TypedListener<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    /// Creates a new typed listener.
    pub fn new(name: String, handler: F) -> Self {
        Self {
            handler,
            name,
            _phantom: PhantomData,
        }
    }
}

impl<T, F> Clone for TypedListener<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync + Clone,
{
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            name: self.name.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T, F> std::fmt::Debug for TypedListener<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedListener")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<T, F> EventListener for TypedListener<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
{
    async fn handle(&self, payload: &[u8]) -> Result<(), EventError> {
        let event = T::decode(payload)?;
        (self.handler)(event)
    }

    fn listener_name(&self) -> &str {
        &self.name
    }
}

/// Async counterpart of [`TypedListener`] for closures that need to await.
pub struct AsyncTypedListener<T, F, Fut>
where
    T: Event,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    handler: F,
    name: String,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<T, F, Fut> AsyncTypedListener<T, F, Fut>
where
    T: Event,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    /// Creates a new async typed listener.
    pub fn new(name: String, handler: F) -> Self {
        Self {
            handler,
            name,
            _phantom: PhantomData,
        }
    }
}

impl<T, F, Fut> std::fmt::Debug for AsyncTypedListener<T, F, Fut>
where
    T: Event,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTypedListener")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<T, F, Fut> EventListener for AsyncTypedListener<T, F, Fut>
where
    T: Event,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EventError>> + Send + 'static,
{
    async fn handle(&self, payload: &[u8]) -> Result<(), EventError> {
        let event = T::decode(payload)?;
        (self.handler)(event).await
    }

    fn listener_name(&self) -> &str {
        &self.name
    }
}
