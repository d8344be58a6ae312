//! URL helpers shared by the completion client and the external MCP
//! transports.

use std::collections::HashMap;

/// Strip trailing slashes so endpoint joins never produce `//`.
///
/// ```
/// use palaver::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://127.0.0.1:1234/v1/"), "http://127.0.0.1:1234/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path.
///
/// ```
/// use palaver::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://127.0.0.1:1234/v1/", "/chat/completions"),
///     "http://127.0.0.1:1234/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

/// Expand `${NAME}` placeholders from `vars`, then from the process
/// environment. Unknown names and unterminated placeholders stay verbatim.
pub fn expand_placeholders(input: &str, vars: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };
        let name = &after[..end];
        match vars
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
        {
            Some(value) if !name.is_empty() => output.push_str(&value),
            _ => output.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    output
}
