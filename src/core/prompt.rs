use crate::api::ChatToolDefinition;
use crate::core::strings::{self, Strings};
use crate::mcp::aggregator::ResourceSnippet;
use crate::mcp::types::ToolInfo;

/// One `• name: description` line per tool.
pub fn tools_list(tools: &[ToolInfo]) -> String {
    tools
        .iter()
        .map(|tool| format!("• {}: {}", tool.name, tool.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// System prompt for a session: the base template (with the tool list when
/// any tool is available), then pre-loaded static resources, then the
/// user's custom addition.
pub fn build_system_prompt(
    strings: &Strings,
    tools: &[ToolInfo],
    snippets: &[ResourceSnippet],
    custom_prompt: Option<&str>,
) -> String {
    let mut prompt = if tools.is_empty() {
        strings.get(strings::SYSTEM_PROMPT)
    } else {
        strings.format(
            strings::SYSTEM_PROMPT_WITH_TOOLS,
            &[("tools_list", tools_list(tools).as_str())],
        )
    };

    if !snippets.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&strings.get(strings::RESOURCES_HEADER));
        for snippet in snippets {
            prompt.push_str(&format!(
                "\n\n### {} ({})\n{}",
                snippet.name, snippet.uri, snippet.text
            ));
        }
    }

    if let Some(custom) = custom_prompt.map(str::trim).filter(|text| !text.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(custom);
    }
    prompt
}

pub fn tool_definitions(tools: &[ToolInfo]) -> Vec<ChatToolDefinition> {
    tools
        .iter()
        .map(|tool| {
            let description = (!tool.description.is_empty()).then(|| tool.description.clone());
            ChatToolDefinition::function(tool.name.clone(), description, tool.input_schema.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn prompt_lists_tools_resources_and_custom_text() {
        let prompt = build_system_prompt(
            &Strings::default(),
            &[tool("get_time", "Current time"), tool("docs_search", "Search docs")],
            &[ResourceSnippet {
                uri: "palaver://config".to_string(),
                name: "config".to_string(),
                text: "model = gpt".to_string(),
            }],
            Some("  Always answer in haiku.  "),
        );

        assert!(prompt.contains("• get_time: Current time\n• docs_search: Search docs"));
        assert!(!prompt.contains("{tools_list}"));
        assert!(prompt.contains("Available resources:\n\n### config (palaver://config)\nmodel = gpt"));
        assert!(prompt.ends_with("\n\nAlways answer in haiku."));
    }

    #[test]
    fn prompt_without_tools_uses_plain_template() {
        let strings = Strings::default();
        let prompt = build_system_prompt(&strings, &[], &[], None);
        assert_eq!(prompt, strings.get(strings::SYSTEM_PROMPT));
    }

    #[test]
    fn definitions_omit_empty_descriptions() {
        let definitions = tool_definitions(&[tool("echo", "")]);
        let value = serde_json::to_value(&definitions).expect("serialize");
        assert_eq!(
            value,
            json!([{
                "type": "function",
                "function": {"name": "echo", "parameters": {"type": "object", "properties": {}}}
            }])
        );
    }
}
