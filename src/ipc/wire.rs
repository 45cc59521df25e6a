//! Application-facing wire messages.
//!
//! One JSON object per line, discriminated by `type`:
//!
//! | type             | direction             |
//! |------------------|-----------------------|
//! | `register`       | application → router  |
//! | `toolInvocation` | router → application  |
//! | `toolResponse`   | application → router  |
//! | `mcp_relay`      | secondary → primary   |
//! | `mcp_relay_ack`  | primary → secondary   |
//! | `mcp_request`    | secondary → primary   |
//! | `mcp_response`   | primary → secondary   |
//! | `error`          | router → any peer     |

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool as published by a tool host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
        }
    }

    /// Set input schema
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Copy of this definition published under `{app}:{name}`.
    pub fn namespaced(&self, app_name: &str) -> Self {
        Self {
            name: NamespacedToolName::join(app_name, &self.name),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Error text, or a generic message when a failing peer sent none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("Tool reported failure")
    }
}

impl From<crate::error::RouteError> for ToolResult {
    fn from(err: crate::error::RouteError) -> Self {
        Self::failure(err.to_string())
    }
}

/// `"{applicationName}:{toolName}"`, split on the first colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedToolName {
    pub app: String,
    pub tool: String,
}

impl NamespacedToolName {
    pub const SEPARATOR: char = ':';

    pub fn join(app: &str, tool: &str) -> String {
        format!("{}{}{}", app, Self::SEPARATOR, tool)
    }

    /// Why `app_name` and `tools` cannot be published as namespaced names,
    /// or `None` when every tool would parse back to its owner.
    pub fn registration_problem(app_name: &str, tools: &[ToolDefinition]) -> Option<String> {
        if app_name.is_empty() {
            return Some("appName must not be empty".to_string());
        }
        if app_name.contains(Self::SEPARATOR) {
            return Some(format!(
                "appName '{}' must not contain '{}'",
                app_name,
                Self::SEPARATOR
            ));
        }
        tools
            .iter()
            .any(|t| t.name.is_empty())
            .then(|| format!("Application '{}' registered a tool with an empty name", app_name))
    }

    /// Parse a namespaced name; both halves must be non-empty.
    pub fn parse(name: &str) -> Option<Self> {
        let (app, tool) = name.split_once(Self::SEPARATOR)?;
        if app.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self {
            app: app.to_string(),
            tool: tool.to_string(),
        })
    }
}

impl std::fmt::Display for NamespacedToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.app, Self::SEPARATOR, self.tool)
    }
}

/// Every message exchanged on the application-facing channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum WireMessage {
    #[serde(rename = "register")]
    Register {
        app_name: String,
        #[serde(default)]
        tools: Vec<ToolDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },

    #[serde(rename = "toolInvocation")]
    ToolInvocation {
        correlation_id: u64,
        tool: String,
        #[serde(default)]
        parameters: Value,
    },

    #[serde(rename = "toolResponse")]
    ToolResponse {
        correlation_id: u64,
        result: ToolResult,
    },

    #[serde(rename = "mcp_relay")]
    RelayRegister {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },

    #[serde(rename = "mcp_relay_ack")]
    RelayAck,

    #[serde(rename = "mcp_request")]
    RelayRequest { payload: Value },

    #[serde(rename = "mcp_response")]
    RelayResponse { payload: Value },

    #[serde(rename = "error")]
    Error { message: String },
}

impl WireMessage {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::ToolInvocation { .. } => "toolInvocation",
            Self::ToolResponse { .. } => "toolResponse",
            Self::RelayRegister { .. } => "mcp_relay",
            Self::RelayAck => "mcp_relay_ack",
            Self::RelayRequest { .. } => "mcp_request",
            Self::RelayResponse { .. } => "mcp_response",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let msg = WireMessage::Register {
            app_name: "Writer".into(),
            tools: vec![ToolDefinition::new("SaveFile", "Save a file")],
            secret: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["appName"], "Writer");
        assert_eq!(value["tools"][0]["name"], "SaveFile");
        assert!(value["tools"][0]["inputSchema"].is_object());
        assert!(value.get("secret").is_none());
    }

    #[test]
    fn test_parse_tool_invocation() {
        let json = r#"{"type":"toolInvocation","correlationId":1,"tool":"SaveFile","parameters":{"path":"a.txt"}}"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            WireMessage::ToolInvocation {
                correlation_id: 1,
                tool: "SaveFile".into(),
                parameters: json!({"path": "a.txt"}),
            }
        );
    }

    #[test]
    fn test_parse_tool_response() {
        let json = r#"{"type":"toolResponse","correlationId":1,"result":{"success":true,"data":{"bytesWritten":12}}}"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        match msg {
            WireMessage::ToolResponse {
                correlation_id,
                result,
            } => {
                assert_eq!(correlation_id, 1);
                assert!(result.success);
                assert_eq!(result.data.unwrap()["bytesWritten"], 12);
                assert!(result.error.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_relay_messages() {
        let relay: WireMessage = serde_json::from_str(r#"{"type":"mcp_relay"}"#).unwrap();
        assert_eq!(relay, WireMessage::RelayRegister { secret: None });

        let ack = serde_json::to_string(&WireMessage::RelayAck).unwrap();
        assert_eq!(ack, r#"{"type":"mcp_relay_ack"}"#);

        let req = WireMessage::RelayRequest {
            payload: json!({"jsonrpc":"2.0","id":3,"method":"tools/list"}),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "mcp_request");
        assert_eq!(value["payload"]["id"], 3);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<WireMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_failure_result_omits_data() {
        let value = serde_json::to_value(ToolResult::failure("nope")).unwrap();
        assert_eq!(value, json!({"success": false, "error": "nope"}));
    }

    #[test]
    fn test_namespaced_name_parse() {
        let name = NamespacedToolName::parse("Writer:SaveFile").unwrap();
        assert_eq!(name.app, "Writer");
        assert_eq!(name.tool, "SaveFile");

        // Only the first colon separates
        let nested = NamespacedToolName::parse("Shell:fs:read").unwrap();
        assert_eq!(nested.app, "Shell");
        assert_eq!(nested.tool, "fs:read");

        assert!(NamespacedToolName::parse("NoColon").is_none());
        assert!(NamespacedToolName::parse(":tool").is_none());
        assert!(NamespacedToolName::parse("app:").is_none());
    }

    #[test]
    fn test_registration_problem() {
        let tools = vec![ToolDefinition::new("SaveFile", "")];
        assert_eq!(NamespacedToolName::registration_problem("Writer", &tools), None);
        assert!(NamespacedToolName::registration_problem("", &tools).is_some());
        assert!(NamespacedToolName::registration_problem("a:b", &tools).is_some());
        assert!(NamespacedToolName::registration_problem("Writer", &[ToolDefinition::new("", "")]).is_some());

        // Colons in the tool half still parse back to the owning app
        let nested = vec![ToolDefinition::new("a:b", "")];
        assert_eq!(NamespacedToolName::registration_problem("Writer", &nested), None);
        let parsed = NamespacedToolName::parse(&NamespacedToolName::join("Writer", "a:b")).unwrap();
        assert_eq!(parsed.app, "Writer");
        assert_eq!(parsed.tool, "a:b");
    }

    #[test]
    fn test_definition_namespaced() {
        let def = ToolDefinition::new("SaveFile", "Save");
        let ns = def.namespaced("Writer");
        assert_eq!(ns.name, "Writer:SaveFile");
        assert_eq!(ns.description, "Save");
        assert_eq!(def.name, "SaveFile");
    }
}
