//! Tools and resources the CLI serves from its own in-process server.

use chrono::{Local, Utc};
use serde_json::{json, Value};

use crate::core::config::Config;
use crate::mcp::server::{
    resource_info, McpServer, ResourceData, ResourceRegistration, ToolRegistration,
};
use crate::mcp::types::{CachePolicy, ResourceAnnotations};

pub const CONFIG_RESOURCE_URI: &str = "palaver://config";
pub const CLOCK_RESOURCE_URI: &str = "palaver://clock";

pub fn register_builtins(server: &McpServer, config: &Config) {
    server.register_tool(ToolRegistration::new(
        "get_current_time",
        "Current local date and time",
        json!({"type": "object", "properties": {}}),
        |_| async { Ok::<_, String>(now()) },
    ));
    server.register_tool(ToolRegistration::new(
        "echo",
        "Repeat the given text back",
        json!({
            "type": "object",
            "properties": {"text": {"type": "string", "description": "Text to repeat"}},
            "required": ["text"]
        }),
        |args| async move {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or("text is required")?;
            Ok::<_, String>(json!({ "text": text }))
        },
    ));

    let summary = config_summary(config);
    server.register_resource(ResourceRegistration::new(
        resource_info(
            CONFIG_RESOURCE_URI,
            "Session configuration",
            Some("text/plain"),
            ResourceAnnotations::default(),
        ),
        move || {
            let summary = summary.clone();
            async move { Ok::<_, String>(ResourceData::Text(summary)) }
        },
    ));
    server.register_resource(ResourceRegistration::new(
        resource_info(
            CLOCK_RESOURCE_URI,
            "Clock",
            Some("application/json"),
            ResourceAnnotations {
                cache_policy: CachePolicy::Dynamic,
                ..ResourceAnnotations::default()
            },
        ),
        || async { Ok::<_, String>(ResourceData::Json(now())) },
    ));
}

fn now() -> Value {
    let local = Local::now();
    json!({
        "local": local.to_rfc3339(),
        "utc": Utc::now().to_rfc3339(),
        "unix": local.timestamp(),
    })
}

/// Non-secret view of the active settings.
fn config_summary(config: &Config) -> String {
    let mut lines = vec![
        format!("model: {}", config.model()),
        format!("endpoint: {}", config.base_url()),
        format!("streaming: {}", config.streaming()),
    ];
    let servers: Vec<&str> = config.enabled_servers().map(|(id, _)| id.as_str()).collect();
    if !servers.is_empty() {
        lines.push(format!("mcp servers: {}", servers.join(", ")));
    }
    lines.join("\n")
}
