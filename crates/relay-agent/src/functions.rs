//! Local functions the model may call, and the registry that exposes them.
//!
//! The registry is built once at startup from the configured handler-set
//! name and never mutated afterwards; sessions share it through an `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::error::{RelayError, Result};
use relay_core::types::{FunctionCall, Turn};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::FunctionDefinition;

/// A locally invocable capability with a declared argument contract.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Unique name the model calls this function by.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema object for the arguments.
    fn parameters(&self) -> Value;
    /// Schema the result must satisfy, if the handler declares one.
    fn returns(&self) -> Option<Value> {
        None
    }
    /// Run with already-validated arguments.
    async fn call(&self, arguments: Value) -> std::result::Result<Value, String>;
}

/// One round trip through a local function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRecord {
    pub name: String,
    pub arguments: Value,
    pub result: std::result::Result<Value, String>,
}

impl FunctionCallRecord {
    /// The function turn fed back to the model. Failures are described in
    /// the turn so the model can react to them.
    pub fn into_turn(self) -> Turn {
        let content = match self.result {
            Ok(Value::String(s)) => s,
            Ok(value) => value.to_string(),
            Err(message) => json!({ "error": message }).to_string(),
        };
        Turn::function_result(self.name, content)
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: Arc<Vec<Arc<dyn FunctionHandler>>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name().to_string()))
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new(handlers: Vec<Arc<dyn FunctionHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve a configured handler-set name. `None` yields an empty registry.
    pub fn from_module(module: Option<&str>) -> Result<Self> {
        match module {
            None => Ok(Self::empty()),
            Some("weather") => Ok(Self::new(vec![Arc::new(WeatherHandler)])),
            Some(other) => Err(RelayError::Config(format!(
                "unknown function module: {other} (available: weather)"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FunctionHandler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    /// Definitions to send with every request of a session.
    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.handlers
            .iter()
            .map(|h| FunctionDefinition {
                name: h.name().to_string(),
                description: h.description().to_string(),
                parameters: h.parameters(),
            })
            .collect()
    }

    /// Look up, validate, and run a model-requested call. Never fails: every
    /// problem is captured in the record's `result`.
    pub async fn invoke(&self, call: &FunctionCall) -> FunctionCallRecord {
        let arguments = if call.arguments.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(&call.arguments)
                .map_err(|e| format!("arguments are not valid JSON: {e}"))
        };

        let result = match (self.get(&call.name), &arguments) {
            (None, _) => Err(format!("unknown function: {}", call.name)),
            (Some(_), Err(e)) => Err(e.clone()),
            (Some(handler), Ok(args)) => run_handler(handler.as_ref(), args.clone()).await,
        };

        if let Err(e) = &result {
            warn!(function = %call.name, error = %e, "function call failed");
        } else {
            debug!(function = %call.name, "function call succeeded");
        }

        FunctionCallRecord {
            name: call.name.clone(),
            arguments: arguments.unwrap_or(Value::Null),
            result,
        }
    }
}

async fn run_handler(
    handler: &dyn FunctionHandler,
    args: Value,
) -> std::result::Result<Value, String> {
    validate(&handler.parameters(), &args, "arguments")?;
    let value = handler.call(args).await?;
    if let Some(schema) = handler.returns() {
        validate(&schema, &value, "result")
            .map_err(|e| format!("handler returned an invalid result: {e}"))?;
    }
    Ok(value)
}

/// Check `value` against a JSON Schema. Every violation is reported, joined
/// with `; ` and prefixed by what was being checked.
pub fn validate(schema: &Value, value: &Value, what: &str) -> std::result::Result<(), String> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| format!("{what}: invalid schema: {e}"))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    Err(format!("{what}: {}", errors.join("; ")))
}

// ---------------------------------------------------------------------------
// Built-in handler sets
// ---------------------------------------------------------------------------

/// Reference handler: canned weather report for a location.
pub struct WeatherHandler;

#[async_trait]
impl FunctionHandler for WeatherHandler {
    fn name(&self) -> &str {
        "get_current_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather in a given location"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The city and state, e.g. San Francisco, CA"
                },
                "unit": { "type": "string", "enum": ["celsius", "fahrenheit"] }
            },
            "required": ["location"]
        })
    }

    fn returns(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["location", "temperature", "unit", "forecast"],
            "properties": { "forecast": { "type": "array", "items": { "type": "string" } } }
        }))
    }

    async fn call(&self, arguments: Value) -> std::result::Result<Value, String> {
        let location = arguments
            .get("location")
            .and_then(Value::as_str)
            .ok_or("location is required")?;
        let unit = arguments
            .get("unit")
            .and_then(Value::as_str)
            .unwrap_or("fahrenheit");
        Ok(json!({
            "location": location,
            "temperature": "72",
            "unit": unit,
            "forecast": ["sunny", "windy"],
        }))
    }
}
