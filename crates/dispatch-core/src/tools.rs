// Dispatch core — Tool Registry.
//
// Schema generation uses an explicit builder rather than reflection: each
// tool is registered with an explicit parameter list and a typed handler,
// and the backend-facing schema is derived and memoized at registration
// time rather than recomputed per request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::error::EngineResult;
use crate::types::PermissionLevel;

/// How the Tool Runner dispatches an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// In-process handler, called directly.
    Builtin,
    /// Shell-family tool, routed through the sandbox launcher.
    Shell,
    /// Forwarded to an external tool-protocol server.
    External,
}

#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub param_type: &'static str,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, param_type: &'static str, description: impl Into<String>) -> Self {
        Self { name: name.into(), param_type, description: description.into(), required: true, default: None }
    }

    pub fn optional(name: impl Into<String>, param_type: &'static str, description: impl Into<String>, default: Value) -> Self {
        Self { name: name.into(), param_type, description: description.into(), required: false, default: Some(default) }
    }
}

/// A tool invocation's runtime context, threaded down from the Dispatcher
/// through the Tool Runner without any ambient global state.
pub struct ToolContext {
    pub conversation_id: String,
    pub permission_level: PermissionLevel,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &ToolContext) -> EngineResult<Value>;
}

/// Adapts a plain closure into a `ToolHandler` — the common case for
/// builtins that don't need their own struct.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = EngineResult<Value>> + Send,
{
    async fn call(&self, args: Value, ctx: &ToolContext) -> EngineResult<Value> {
        let ctx = ToolContext { conversation_id: ctx.conversation_id.clone(), permission_level: ctx.permission_level };
        (self.0)(args, ctx).await
    }
}

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParam>,
    pub required_permission: PermissionLevel,
    pub category: ToolCategory,
    /// True if the tool calls out over the network — gates the Tool
    /// Runner's offline tool-result cache consultation.
    pub network_dependent: bool,
    /// True if the tool opts in to result caching.
    pub cacheable: bool,
    pub handler: Arc<dyn ToolHandler>,
    /// Memoized schema, computed once at registration.
    schema: Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParam>,
        required_permission: PermissionLevel,
        category: ToolCategory,
        network_dependent: bool,
        cacheable: bool,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        let schema = build_schema(&parameters);
        Self { name, description, parameters, required_permission, category, network_dependent, cacheable, handler, schema }
    }

    pub fn descriptor_a(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.schema,
            }
        })
    }

    pub fn descriptor_b(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.schema,
        })
    }
}

fn build_schema(parameters: &[ToolParam]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in parameters {
        let mut prop = json!({
            "type": p.param_type,
            "description": p.description,
        });
        if let Some(default) = &p.default {
            prop["default"] = default.clone();
        }
        properties.insert(p.name.clone(), prop);
        if p.required {
            required.push(Value::String(p.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
    })
}

/// Which wire shape a backend wants its tool descriptors in. Threaded
/// in by the adapter rather than derived from `Capabilities`, since shape is
/// a protocol-family property, not a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorShape {
    /// `{ type: "function", function: {...} }`
    A,
    /// `{ name, description, input_schema }`
    B,
}

#[derive(Default)]
pub struct ToolRegistry {
    specs: RwLock<HashMap<String, Arc<ToolSpec>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent by name: re-registering the same name replaces the prior
    /// spec rather than erroring, matching "must be called before any
    /// request runs" start-up wiring where registration order can vary.
    pub fn register(&self, spec: ToolSpec) {
        self.specs.write().insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.specs.read().get(name).cloned()
    }

    pub fn describe_for(&self, shape: DescriptorShape) -> Vec<Value> {
        self.specs
            .read()
            .values()
            .map(|s| match shape {
                DescriptorShape::A => s.descriptor_a(),
                DescriptorShape::B => s.descriptor_b(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value, _ctx: &ToolContext) -> EngineResult<Value> {
            Ok(args["s"].clone())
        }
    }

    fn echo_spec() -> ToolSpec {
        ToolSpec::new(
            "echo",
            "Echoes its input back",
            vec![ToolParam::required("s", "string", "text to echo")],
            PermissionLevel::Sandbox,
            ToolCategory::Builtin,
            false,
            false,
            Arc::new(Echo),
        )
    }

    #[test]
    fn register_is_idempotent_by_name() {
        let reg = ToolRegistry::new();
        reg.register(echo_spec());
        reg.register(echo_spec());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn get_returns_registered_spec() {
        let reg = ToolRegistry::new();
        reg.register(echo_spec());
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn describe_for_emits_both_shapes() {
        let reg = ToolRegistry::new();
        reg.register(echo_spec());

        let a = reg.describe_for(DescriptorShape::A);
        assert_eq!(a[0]["type"], "function");
        assert_eq!(a[0]["function"]["name"], "echo");

        let b = reg.describe_for(DescriptorShape::B);
        assert_eq!(b[0]["name"], "echo");
        assert!(b[0]["input_schema"]["properties"]["s"].is_object());
    }

    #[test]
    fn schema_marks_required_parameters() {
        let spec = echo_spec();
        let required = spec.descriptor_a()["function"]["parameters"]["required"].clone();
        assert_eq!(required, json!(["s"]));
    }

    #[tokio::test]
    async fn handler_executes() {
        let spec = echo_spec();
        let ctx = ToolContext { conversation_id: "c1".into(), permission_level: PermissionLevel::Full };
        let result = spec.handler.call(json!({"s": "hi"}), &ctx).await.unwrap();
        assert_eq!(result, json!("hi"));
    }
}
