//! Tool System
//!
//! Tools are registered once at startup into an immutable [`ToolRegistry`]
//! and resolved by name when the model requests them. Arguments are checked
//! against the declared [`ToolSchema`] before a tool ever sees them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{AgentError, Result, ToolErrorKind};

/// Tool call request from the model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier, unique within one iteration
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Argument payload (a JSON object for well-formed calls)
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a single call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Failure,
}

/// Result from tool execution, answering exactly one [`ToolCall`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Identifier of the call this answers
    pub call_id: String,

    /// Tool that was called
    pub name: String,

    pub status: ToolStatus,

    /// Output payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Error description on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status: ToolStatus::Success,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, error: ToolErrorKind) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status: ToolStatus::Failure,
            output: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Text rendering fed back to the model
    pub fn render(&self) -> String {
        match (&self.output, &self.error) {
            (Some(output), _) if self.is_success() => {
                format!("[Tool '{}' returned]\n{}", self.name, output)
            }
            (_, Some(error)) => format!("[Tool '{}' failed]\n{}", self.name, error),
            _ => format!("[Tool '{}' failed]", self.name),
        }
    }
}

/// JSON type of a parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParamType,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            enum_values: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// Tool definition schema (for model function calling)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to the model)
    pub description: String,

    /// Parameter definitions
    pub parameters: Vec<ParameterSchema>,

    /// Accept argument keys not listed in `parameters`
    #[serde(default)]
    pub additional_properties: bool,

    /// Whether tool has side effects outside the process
    #[serde(default)]
    pub has_side_effects: bool,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            additional_properties: false,
            has_side_effects: false,
        }
    }

    pub fn param(mut self, param: ParameterSchema) -> Self {
        self.parameters.push(param);
        self
    }

    /// Check an argument payload against the declared parameters
    pub fn validate(&self, arguments: &Value) -> std::result::Result<(), String> {
        let Some(object) = arguments.as_object() else {
            if arguments.is_null() && self.parameters.iter().all(|p| !p.required) {
                return Ok(());
            }
            return Err("arguments must be a JSON object".into());
        };

        for param in &self.parameters {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(format!("missing required parameter `{}`", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !param.param_type.matches(value) {
                        return Err(format!(
                            "parameter `{}` must be of type {}",
                            param.name,
                            param.param_type.as_str()
                        ));
                    }
                    if let Some(allowed) = &param.enum_values {
                        if !allowed.contains(value) {
                            return Err(format!(
                                "parameter `{}` must be one of {}",
                                param.name,
                                Value::Array(allowed.clone())
                            ));
                        }
                    }
                }
            }
        }

        if !self.additional_properties {
            if let Some(unknown) = object
                .keys()
                .find(|key| !self.parameters.iter().any(|p| &p.name == *key))
            {
                return Err(format!("unknown parameter `{unknown}`"));
            }
        }

        Ok(())
    }

    /// Render as a JSON Schema object for provider function-calling APIs
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| {
                let mut prop = serde_json::json!({
                    "type": p.param_type.as_str(),
                    "description": p.description,
                });
                if let Some(values) = &p.enum_values {
                    prop["enum"] = Value::Array(values.clone());
                }
                (p.name.clone(), prop)
            })
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": self.additional_properties,
            }
        })
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for model function calling
    fn schema(&self) -> ToolSchema;

    /// Run with pre-validated arguments
    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value>;
}

/// A registered tool: its schema captured once plus the execution handle
#[derive(Clone)]
pub struct ToolSpec {
    pub schema: ToolSchema,
    pub handle: Arc<dyn Tool>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Immutable name -> tool mapping. Build it with [`ToolRegistry::builder`].
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Resolve a tool by name
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Resolve a call to its tool and validate the arguments
    pub fn resolve(&self, call: &ToolCall) -> std::result::Result<&ToolSpec, ToolErrorKind> {
        let spec = self
            .get(&call.name)
            .ok_or_else(|| ToolErrorKind::UnknownTool(call.name.clone()))?;
        spec.schema
            .validate(&call.arguments)
            .map_err(ToolErrorKind::InvalidArguments)?;
        Ok(spec)
    }

    /// All tool schemas, ordered by name
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema.clone()).collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Startup-time registry construction
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Register a new tool
    #[must_use]
    pub fn register<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Register a shared tool
    #[must_use]
    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Freeze the mapping. Duplicate names are a configuration error.
    pub fn build(self) -> Result<ToolRegistry> {
        let mut tools = BTreeMap::new();
        for handle in self.tools {
            let schema = handle.schema();
            if tools.contains_key(&schema.name) {
                return Err(AgentError::Config(format!(
                    "tool `{}` registered twice",
                    schema.name
                )));
            }
            tools.insert(schema.name.clone(), ToolSpec { schema, handle });
        }
        Ok(ToolRegistry { tools })
    }
}
