pub mod clarify;
pub mod sql;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::env::Task;
use crate::error::{CapabilityError, SchemaError};
use crate::llm::ModelToolDefinition;

/// What a capability learns about the episode it is invoked in.
#[derive(Clone, Debug)]
pub struct InvocationContext {
    pub task_index: usize,
    pub task: Arc<Task>,
}

type CapabilityHandler = dyn Fn(Value, InvocationContext) -> BoxFuture<'static, Result<String, CapabilityError>>
    + Send
    + Sync;
type ResetHook = dyn Fn() + Send + Sync;

/// A named, schema-described operation the agent may invoke.
#[derive(Clone)]
pub struct Capability {
    name: String,
    description: String,
    input_schema: Value,
    handler: Arc<CapabilityHandler>,
    reset_hook: Option<Arc<ResetHook>>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("has_reset_hook", &self.reset_hook.is_some())
            .finish()
    }
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
            handler: Arc::new(|_args, _ctx| {
                Box::pin(async {
                    Err(CapabilityError::Execution(
                        "capability handler not configured".to_string(),
                    ))
                })
            }),
            reset_hook: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_schema(&schema)?;
        self.input_schema = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, CapabilityError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, ctx| Box::pin(handler(args, ctx)));
        self
    }

    /// Registers a hook run on every environment reset, for per-task caches.
    pub fn with_reset_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reset_hook = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn definition(&self) -> ModelToolDefinition {
        ModelToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }

    pub fn reset(&self) {
        if let Some(hook) = &self.reset_hook {
            hook();
        }
    }

    pub async fn invoke(
        &self,
        args: Value,
        ctx: InvocationContext,
    ) -> Result<String, CapabilityError> {
        validate_arguments(self.name(), &self.input_schema, &args)?;
        (self.handler)(args, ctx).await
    }
}

/// Reads a required string argument; the schema check has already run.
pub(crate) fn string_arg<'a>(
    capability: &str,
    args: &'a Value,
    key: &str,
) -> Result<&'a str, CapabilityError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CapabilityError::InvalidArguments {
            capability: capability.to_string(),
            message: format!("missing string field: {key}"),
        })
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

fn validate_arguments(capability: &str, schema: &Value, args: &Value) -> Result<(), CapabilityError> {
    let invalid = |message: String| CapabilityError::InvalidArguments {
        capability: capability.to_string(),
        message,
    };

    let args_obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;

    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for field_name in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(field_name) {
                return Err(invalid(format!("missing required field: {field_name}")));
            }
        }
    }

    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if schema_obj
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false)
    {
        if let Some(key) = args_obj.keys().find(|key| !properties.contains_key(*key)) {
            return Err(invalid(format!("unknown field: {key}")));
        }
    }

    for (key, value) in args_obj {
        let Some(field_schema) = properties.get(key) else {
            continue;
        };
        if let Some(type_name) = field_schema.get("type").and_then(Value::as_str) {
            if !value_matches_type(value, type_name) {
                return Err(invalid(format!("field '{key}' must be of type {type_name}")));
            }
        }
        if let Some(allowed) = field_schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(invalid(format!("field '{key}' must be one of {}", Value::Array(allowed.clone()))));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn ctx() -> InvocationContext {
        InvocationContext {
            task_index: 0,
            task: Arc::new(Task::new("count patients")),
        }
    }

    fn echo() -> Capability {
        Capability::new("echo", "echo a word")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "word": {"type": "string"},
                    "mode": {"type": "string", "enum": ["upper", "lower"]}
                },
                "required": ["word"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args, _ctx| async move {
                let word = string_arg("echo", &args, "word")?;
                Ok(match args.get("mode").and_then(Value::as_str) {
                    Some("upper") => word.to_uppercase(),
                    _ => word.to_lowercase(),
                })
            })
    }

    #[test]
    fn schema_validation_rejects_non_object_root() {
        let result = Capability::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(matches!(result, Err(SchemaError::RootTypeMustBeObject)));

        let result = Capability::new("bad", "bad")
            .with_schema(json!({"type": "object", "required": [1]}));
        assert!(matches!(result, Err(SchemaError::InvalidRequired)));
    }

    #[tokio::test]
    async fn invoke_runs_handler_with_valid_arguments() {
        let observation = echo()
            .invoke(json!({"word": "Hb", "mode": "upper"}), ctx())
            .await
            .expect("runs");
        assert_eq!(observation, "HB");
    }

    #[tokio::test]
    async fn argument_validation_reports_problems() {
        let capability = echo();

        let missing = capability.invoke(json!({}), ctx()).await.expect_err("missing");
        assert!(missing.to_string().contains("missing required field: word"));

        let unknown = capability
            .invoke(json!({"word": "a", "extra": 1}), ctx())
            .await
            .expect_err("unknown");
        assert!(unknown.to_string().contains("unknown field: extra"));

        let wrong_enum = capability
            .invoke(json!({"word": "a", "mode": "title"}), ctx())
            .await
            .expect_err("enum");
        assert!(wrong_enum.to_string().contains("must be one of"));

        let not_object = capability
            .invoke(json!("{not json"), ctx())
            .await
            .expect_err("raw string");
        assert!(not_object.to_string().contains("must be a JSON object"));
    }

    #[test]
    fn reset_runs_registered_hook() {
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = resets.clone();
        let capability = Capability::new("cached", "has per-task state").with_reset_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        capability.reset();
        capability.reset();
        echo().reset();

        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert_eq!(capability.definition().name, "cached");
    }
}
