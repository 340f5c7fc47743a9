//! MCP payload types: handshake, capabilities, and catalog entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Methods & protocol versions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ELICITATION_CREATE: &str = "elicitation/create";
}

/// The only protocol version accepted over stdio.
pub const STDIO_PROTOCOL_VERSION: &str = "2025-11-25";

/// Versions the HTTP transport accepts from upstream SDKs.
pub const HTTP_PROTOCOL_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

/// The aggregation kind a `list_changed` notification refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ListChangedKind {
    Tools,
    Resources,
    Prompts,
}

impl ListChangedKind {
    /// Map a notification method to its kind, if it is a list_changed.
    pub fn from_method(method: &str) -> Option<ListChangedKind> {
        match method {
            "notifications/tools/list_changed" => Some(ListChangedKind::Tools),
            "notifications/resources/list_changed" => Some(ListChangedKind::Resources),
            "notifications/prompts/list_changed" => Some(ListChangedKind::Prompts),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcpv".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Capabilities the gateway advertises to a downstream. Sampling and
/// elicitation are present iff the runtime wired the matching handlers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

/// Per-capability flags a downstream may report.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    #[serde(default)]
    pub list_changed: bool,
    #[serde(default)]
    pub subscribe: bool,
}

/// Capabilities reported by a downstream in its initialize response.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<CapabilityFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<CapabilityFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<CapabilityFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default)]
    pub server_info: ServerInfo,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single tool definition returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A single resource definition returned by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

/// An argument a prompt accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// A single prompt definition returned by `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResourcesListResult {
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PromptsListResult {
    #[serde(default)]
    pub prompts: Vec<PromptDef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_changed_method_mapping() {
        assert_eq!(
            ListChangedKind::from_method("notifications/tools/list_changed"),
            Some(ListChangedKind::Tools)
        );
        assert_eq!(
            ListChangedKind::from_method("notifications/prompts/list_changed"),
            Some(ListChangedKind::Prompts)
        );
        assert_eq!(ListChangedKind::from_method("notifications/progress"), None);
    }

    #[test]
    fn capabilities_omitted_without_handlers() {
        let params = InitializeParams {
            protocol_version: STDIO_PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::default(),
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(!json.contains("sampling"));
        assert!(!json.contains("elicitation"));
        assert!(json.contains("\"protocolVersion\":\"2025-11-25\""));
    }

    #[test]
    fn capabilities_present_with_handlers() {
        let caps = ClientCapabilities {
            sampling: Some(serde_json::json!({})),
            elicitation: None,
        };
        let json = serde_json::to_string(&caps).unwrap();
        assert!(json.contains("sampling"));
        assert!(!json.contains("elicitation"));
    }

    #[test]
    fn initialize_result_parses_capabilities() {
        let raw = r#"{
            "protocolVersion": "2025-11-25",
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": {},
                "logging": {}
            },
            "serverInfo": { "name": "demo", "version": "1.0.0" }
        }"#;
        let result: InitializeResult = serde_json::from_str(raw).unwrap();
        assert!(result.capabilities.tools.as_ref().unwrap().list_changed);
        assert!(!result.capabilities.resources.as_ref().unwrap().list_changed);
        assert!(result.capabilities.prompts.is_none());
        assert_eq!(result.server_info.name, "demo");
    }

    #[test]
    fn tool_def_defaults_schema() {
        let tool: ToolDef = serde_json::from_str(r#"{ "name": "ping" }"#).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_empty());
    }

    #[test]
    fn resource_and_prompt_parse() {
        let res: ResourceDef = serde_json::from_str(
            r#"{ "uri": "file:///tmp/a.txt", "name": "a", "mimeType": "text/plain" }"#,
        )
        .unwrap();
        assert_eq!(res.mime_type.as_deref(), Some("text/plain"));

        let prompt: PromptDef = serde_json::from_str(
            r#"{ "name": "summarize", "arguments": [{ "name": "text", "required": true }] }"#,
        )
        .unwrap();
        assert!(prompt.arguments[0].required);
    }

    #[test]
    fn http_versions_include_stdio_version() {
        assert!(HTTP_PROTOCOL_VERSIONS.contains(&STDIO_PROTOCOL_VERSION));
    }
}
