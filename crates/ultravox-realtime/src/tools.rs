//! Client Tool Registry
//!
//! Tools are local capabilities the remote agent can invoke mid-call. Each tool is
//! a name, a human description, a JSON parameter schema and a [`ToolHandler`].
//! Synchronous and asynchronous handlers share the one async `invoke` contract, so
//! dispatch never needs to know which kind it is calling.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{error, info};

/// The arguments the agent supplied for one invocation.
pub type Parameters = Map<String, Value>;

/// Why a tool handler could not produce a result.
///
/// This is a closed set: each variant maps to a stable `errorType` on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The invocation's parameters were missing or of the wrong shape.
    #[error("{0}")]
    InvalidParameters(String),
    /// The tool ran but could not complete the request.
    #[error("{0}")]
    Failed(String),
    /// An unexpected failure inside the handler.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    /// The handler panicked.
    #[error("tool panicked: {0}")]
    Panicked(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidParameters(_) => "invalid_parameters",
            ToolError::Failed(_) => "failed",
            ToolError::Internal(_) => "internal",
            ToolError::Panicked(_) => "panic",
        }
    }

    /// The `errorType` reported to the remote agent.
    pub fn wire_type(&self) -> String {
        format!("handler_error:{}", self.kind())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::InvalidParameters(err.to_string())
    }
}

/// A capability the remote agent can call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, parameters: Parameters) -> Result<Value, ToolError>;
}

/// Adapts a synchronous closure into a [`ToolHandler`]. See [`tool_fn`].
pub struct FnTool<F>(F);

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(Parameters) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    async fn invoke(&self, parameters: Parameters) -> Result<Value, ToolError> {
        (self.0)(parameters)
    }
}

/// Adapts a closure returning a future into a [`ToolHandler`]. See [`async_tool_fn`].
pub struct AsyncFnTool<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for AsyncFnTool<F>
where
    F: Fn(Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn invoke(&self, parameters: Parameters) -> Result<Value, ToolError> {
        (self.0)(parameters).await
    }
}

/// Wraps a synchronous function as a tool handler.
pub fn tool_fn<F>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Parameters) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    Arc::new(FnTool(f))
}

/// Wraps an asynchronous function as a tool handler.
pub fn async_tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(AsyncFnTool(f))
}

/// A registered tool, including its handler.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    /// The externally visible part of the definition.
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// A tool definition without its handler, as returned by [`ToolRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Tool '{0}' is not registered")]
    NotRegistered(String),
    #[error("Invalid parameter schema: {0}")]
    InvalidSchema(String),
    #[error("Tool '{name}' failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: ToolError,
    },
}

/// A shared, clonable registry of tools keyed by name.
///
/// Clones share the same underlying table. Listing order is name order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<BTreeMap<String, ToolDefinition>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new tool.
    ///
    /// Fails if the name is taken or if `parameters` is not an object schema with a
    /// `properties` field. A missing `type` is filled in as `"object"`.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
        description: impl Into<String>,
        parameters: Option<Value>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut tools = self.write();
        if tools.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        let parameters = validate_schema(parameters)?;
        tools.insert(
            name.clone(),
            ToolDefinition {
                name: name.clone(),
                description: description.into(),
                parameters,
                handler,
            },
        );
        info!(tool = %name, "Registered tool");
        Ok(())
    }

    /// Inserts a handler under `name`, replacing any existing tool of that name.
    pub fn insert(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let name = name.into();
        let definition = ToolDefinition {
            name: name.clone(),
            description: String::new(),
            parameters: default_schema(),
            handler,
        };
        self.write().insert(name, definition);
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        self.write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        info!(tool = %name, "Unregistered tool");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ToolDefinition, RegistryError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.read()
            .values()
            .map(ToolDefinition::descriptor)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Runs the named tool.
    ///
    /// Handler failures are logged and then returned to the caller as
    /// [`RegistryError::Handler`].
    pub async fn execute(&self, name: &str, parameters: Parameters) -> Result<Value, RegistryError> {
        match self.dispatch(name, parameters).await {
            Some(result) => result.map_err(|source| RegistryError::Handler {
                name: name.to_string(),
                source,
            }),
            None => Err(RegistryError::NotRegistered(name.to_string())),
        }
    }

    /// Runs the named tool, or returns `None` if no tool has that name.
    ///
    /// A panicking handler is reported as [`ToolError::Panicked`].
    pub(crate) async fn dispatch(
        &self,
        name: &str,
        parameters: Parameters,
    ) -> Option<Result<Value, ToolError>> {
        let handler = self.handler(name)?;
        let result = match AssertUnwindSafe(handler.invoke(parameters))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(ToolError::Panicked(panic_message(payload.as_ref()))),
        };
        if let Err(e) = &result {
            error!(tool = %name, error = %e, "Error executing tool");
        }
        Some(result)
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.read().get(name).map(|tool| Arc::clone(&tool.handler))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ToolDefinition>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ToolDefinition>> {
        self.tools.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.read().keys())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn default_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn validate_schema(schema: Option<Value>) -> Result<Value, RegistryError> {
    let fields = match schema {
        None | Some(Value::Null) => return Ok(default_schema()),
        Some(Value::Object(fields)) if fields.is_empty() => return Ok(default_schema()),
        Some(Value::Object(fields)) => fields,
        Some(_) => {
            return Err(RegistryError::InvalidSchema(
                "parameters must be a JSON object".to_string(),
            ));
        }
    };
    if !fields.contains_key("properties") {
        return Err(RegistryError::InvalidSchema(
            "parameters must have a 'properties' field".to_string(),
        ));
    }
    let mut fields = fields;
    fields
        .entry("type")
        .or_insert_with(|| Value::String("object".to_string()));
    Ok(Value::Object(fields))
}
