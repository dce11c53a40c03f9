//! Tool System
//!
//! Tools are described once at startup by an immutable [`ToolDescriptor`],
//! registered in an ordered [`ToolRegistry`] and invoked through the
//! [`ToolDispatcher`], which isolates failures so that a bad call never
//! aborts generation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Name of the identity argument injected for username-scoped tools
pub const USERNAME_PARAM: &str = "username";

/// Declared type of a tool parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
        }
    }
}

/// A validated argument value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// Declared type
    #[serde(rename = "type")]
    pub param_type: ParamType,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Allowed values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl ParameterSchema {
    /// Required parameter
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            enum_values: None,
        }
    }

    /// Optional parameter
    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    /// Restrict to a fixed set of values
    #[must_use]
    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn coerce(&self, raw: &Value) -> std::result::Result<ParamValue, String> {
        let type_error = || {
            format!(
                "Error: Parameter '{}' must be of type {}, got {raw}",
                self.name, self.param_type
            )
        };

        let value = match (self.param_type, raw) {
            (ParamType::String, Value::String(s)) => ParamValue::String(s.clone()),
            (ParamType::String, Value::Number(n)) => ParamValue::String(n.to_string()),
            (ParamType::String, Value::Bool(b)) => ParamValue::String(b.to_string()),
            (ParamType::Integer, Value::Number(n)) => {
                ParamValue::Integer(n.as_i64().ok_or_else(type_error)?)
            }
            (ParamType::Integer, Value::String(s)) => {
                ParamValue::Integer(s.trim().parse().map_err(|_| type_error())?)
            }
            (ParamType::Number, Value::Number(n)) => {
                ParamValue::Number(n.as_f64().ok_or_else(type_error)?)
            }
            (ParamType::Number, Value::String(s)) => {
                ParamValue::Number(s.trim().parse().map_err(|_| type_error())?)
            }
            (ParamType::Boolean, Value::Bool(b)) => ParamValue::Boolean(*b),
            (ParamType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => ParamValue::Boolean(true),
                "false" => ParamValue::Boolean(false),
                _ => return Err(type_error()),
            },
            _ => return Err(type_error()),
        };

        if let Some(allowed) = &self.enum_values {
            let rendered = value.to_string();
            if !allowed.iter().any(|a| *a == rendered) {
                return Err(format!(
                    "Error: Invalid value '{rendered}' for parameter '{}'. Allowed values: {}",
                    self.name,
                    allowed.join(", ")
                ));
            }
        }

        Ok(value)
    }
}

/// Immutable description of a tool, shown to the model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions, in declaration order
    pub parameters: Vec<ParameterSchema>,

    /// Whether the dispatcher should pass the caller's username
    #[serde(default)]
    pub requires_username: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            requires_username: false,
        }
    }

    #[must_use]
    pub fn param(mut self, param: ParameterSchema) -> Self {
        self.parameters.push(param);
        self
    }

    #[must_use]
    pub const fn with_username(mut self) -> Self {
        self.requires_username = true;
        self
    }

    /// Names of required parameters, in declaration order
    pub fn required_names(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// JSON-schema object used by native tool-calling vendors
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            let mut prop = json!({
                "type": param.param_type.to_string(),
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = json!(values);
            }
            properties.insert(param.name.clone(), prop);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_names(),
        })
    }

    /// Tag-form description used in manual-mode system prompts
    pub fn describe_xml(&self) -> String {
        let mut out = String::from("<tool_description>\n");
        let _ = writeln!(out, "<tool_name>{}</tool_name>", self.name);
        let _ = writeln!(out, "<description>{}</description>", self.description);
        out.push_str("<parameters>\n");
        for param in &self.parameters {
            out.push_str("<parameter>\n");
            let _ = writeln!(out, "<name>{}</name>", param.name);
            let _ = writeln!(out, "<type>{}</type>", param.param_type);
            if let Some(values) = &param.enum_values {
                let _ = writeln!(out, "<enum>{}</enum>", values.join(", "));
            }
            let _ = writeln!(out, "<description>{}</description>", param.description);
            out.push_str("</parameter>\n");
        }
        out.push_str("</parameters>\n");
        let _ = writeln!(
            out,
            "<required_parameters>{}</required_parameters>",
            self.required_names().join(", ")
        );
        out.push_str("</tool_description>");
        out
    }

    /// Validate raw arguments against the schema.
    ///
    /// The error is a message meant to be fed back to the model.
    pub fn coerce(&self, raw: &Map<String, Value>) -> std::result::Result<ToolArgs, String> {
        let unexpected: Vec<&str> = raw
            .keys()
            .filter(|k| !self.parameters.iter().any(|p| &p.name == *k))
            .map(String::as_str)
            .collect();
        if !unexpected.is_empty() {
            return Err(format!(
                "Error: Unexpected parameter(s): {}",
                unexpected.join(",")
            ));
        }

        let missing: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required && raw.get(&p.name).is_none_or(Value::is_null))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "Error: Missing required parameter(s): {}",
                missing.join(",")
            ));
        }

        let mut args = ToolArgs::default();
        for param in &self.parameters {
            match raw.get(&param.name) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    args.values
                        .insert(param.name.clone(), param.coerce(value)?);
                }
            }
        }
        Ok(args)
    }
}

/// Validated arguments handed to a tool
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolArgs {
    values: BTreeMap<String, ParamValue>,
    username: Option<String>,
}

impl ToolArgs {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_str)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParamValue::as_i64)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ParamValue::as_bool)
    }

    /// Caller identity, present only for username-scoped tools
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a tool returns: a value, or a lazy sequence whose last element
/// is the result
pub enum ToolOutput {
    Text(String),
    Stream(BoxStream<'static, String>),
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

impl std::fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's immutable descriptor
    fn descriptor(&self) -> &ToolDescriptor;

    /// Execute the tool with validated arguments
    async fn invoke(&self, args: ToolArgs) -> Result<ToolOutput>;
}

/// Ordered registry of available tools.
///
/// Cloning is cheap; a clone is the per-conversation snapshot.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool; a tool with the same name is replaced in place
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.clone();
        if let Some(&idx) = self.index.get(&name) {
            self.tools[idx] = tool;
        } else {
            self.index.insert(name, self.tools.len());
            self.tools.push(tool);
        }
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&idx| Arc::clone(&self.tools[idx]))
    }

    /// Descriptors in registration order
    pub fn describe_all(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.descriptor().clone()).collect()
    }

    /// `<tools>` block for manual-mode prompts
    pub fn describe_xml(&self) -> String {
        let mut out = String::from("<tools>\n");
        for tool in &self.tools {
            out.push_str(&tool.descriptor().describe_xml());
            out.push('\n');
        }
        out.push_str("</tools>");
        out
    }

    /// Snapshot restricted to the given names; unknown names are ignored
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut subset = Self::new();
        for tool in &self.tools {
            let name = &tool.descriptor().name;
            if names.iter().any(|n| n.as_ref() == name) {
                subset.register_arc(Arc::clone(tool));
            }
        }
        subset
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(|t| t.descriptor().name.as_str())
            .collect()
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

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// One dispatcher call, kept for observability
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub tool_name: String,
    pub execution_time: Duration,
    pub result_length: usize,
}

/// Per-turn invocation log shared by clones of a dispatcher
#[derive(Clone, Debug, Default)]
pub struct InvocationLog {
    records: Arc<Mutex<Vec<ToolInvocationRecord>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: ToolInvocationRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Copy of the current records
    pub fn snapshot(&self) -> Vec<ToolInvocationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the log; called at the end of each turn
    pub fn take(&self) -> Vec<ToolInvocationRecord> {
        std::mem::take(
            &mut *self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// How the dispatcher shapes the final result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultMode {
    /// Bare result text (native tool calling)
    ResultsOnly,
    /// `<function_results>` envelope plus scratchpad nudge (manual mode)
    Wrapped,
}

/// Item of a streaming dispatch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Intermediate value from a streaming tool
    Progress(String),
    /// Final result, shaped per [`ResultMode`]
    Result(String),
}

/// Maps tool names to tools and runs them with failure isolation
#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    registry: ToolRegistry,
    log: InvocationLog,
    username: Option<String>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            log: InvocationLog::new(),
            username: None,
        }
    }

    /// Identity passed to username-scoped tools
    #[must_use]
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    /// Share an existing invocation log
    #[must_use]
    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.log = log;
        self
    }

    pub const fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub const fn log(&self) -> &InvocationLog {
        &self.log
    }

    /// Run a tool and return only its final result.
    ///
    /// Never fails: unknown tools, invalid arguments, tool errors and tool
    /// panics all become the returned text.
    pub async fn invoke(&self, name: &str, raw_args: Map<String, Value>, mode: ResultMode) -> String {
        let mut events = self.invoke_stream(name, raw_args, mode);
        let mut result = String::new();
        while let Some(event) = events.next().await {
            if let DispatchEvent::Result(text) = event {
                result = text;
            }
        }
        result
    }

    /// Run a tool, forwarding intermediate values of streaming tools.
    ///
    /// The stream always ends with exactly one [`DispatchEvent::Result`].
    pub fn invoke_stream(
        &self,
        name: &str,
        mut raw_args: Map<String, Value>,
        mode: ResultMode,
    ) -> BoxStream<'static, DispatchEvent> {
        let dispatcher = self.clone();
        let name = name.to_string();

        Box::pin(async_stream::stream! {
            let started = Instant::now();
            let mut result = String::new();

            match dispatcher.registry.get(&name) {
                None => {
                    result = format!(
                        "Tool {name} not found. Please check tool name. Available tools: {}",
                        dispatcher.registry.names().join(", ")
                    );
                }
                Some(tool) => {
                    let descriptor = tool.descriptor();
                    raw_args.remove(USERNAME_PARAM);

                    match descriptor.coerce(&raw_args) {
                        Err(message) => result = message,
                        Ok(mut args) => {
                            if descriptor.requires_username {
                                if let Some(username) = &dispatcher.username {
                                    args = args.with_username(username.clone());
                                }
                            }

                            match AssertUnwindSafe(tool.invoke(args)).catch_unwind().await {
                                Err(panic) => result = panic_message(&*panic),
                                Ok(Err(e)) => result = format!("Error: {e}"),
                                Ok(Ok(ToolOutput::Text(text))) => result = text,
                                Ok(Ok(ToolOutput::Stream(mut values))) => loop {
                                    match AssertUnwindSafe(values.next()).catch_unwind().await {
                                        Ok(Some(value)) => {
                                            yield DispatchEvent::Progress(value.clone());
                                            result = value;
                                        }
                                        Ok(None) => break,
                                        Err(panic) => {
                                            result = panic_message(&*panic);
                                            break;
                                        }
                                    }
                                },
                            }
                        }
                    }
                }
            }

            let record = ToolInvocationRecord {
                tool_name: name.clone(),
                execution_time: started.elapsed(),
                result_length: result.len(),
            };
            tracing::debug!(
                tool = %record.tool_name,
                execution_time = ?record.execution_time,
                result_length = record.result_length,
                "Tool invoked"
            );
            dispatcher.log.push(record);

            let result = match mode {
                ResultMode::ResultsOnly => result,
                ResultMode::Wrapped => crate::manual::wrap_result(&name, &result),
            };
            yield DispatchEvent::Result(result);
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    tracing::warn!(%detail, "Tool panicked");
    format!("Error: tool panicked: {detail}")
}
