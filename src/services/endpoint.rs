//! User-Endpoint Caller
//!
//! Builds an HTTP request from a stored JSON template, injects API-key
//! material per the configured placement, executes with a hard timeout and
//! extracts the answer string via a path expression. No retry at this
//! layer; retry policy belongs to the dispatching processor.

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::models::job::{EndpointConfig, KeyPlacement};

/// Placeholder token that must appear somewhere in the hydrated template.
pub const PROMPT_PLACEHOLDER: &str = "{{PROMPT}}";

/// Hard per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header names some providers require even when the key is placed
/// elsewhere; a matching field name mirrors the key onto the header too.
const PROVIDER_KEY_HEADERS: &[&str] = &["x-api-key", "x-goog-api-key"];

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Invalid request template: {0}")]
    Template(String),

    #[error("Invalid endpoint configuration: {0}")]
    Config(String),

    #[error("Endpoint call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Endpoint returned an error: {0}")]
    Http(String),

    #[error("Failed to extract answer from response: {0}")]
    Extraction(String),
}

/// A fully prepared outbound request: URL with any query-param key
/// appended, headers to set, hydrated JSON body.
#[derive(Debug)]
pub struct PreparedRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Calls user endpoints described by an [`EndpointConfig`].
pub struct EndpointCaller {
    http: reqwest::Client,
}

impl EndpointCaller {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Execute one collection call: hydrate, place the key, POST with the
    /// hard timeout, extract the answer via the configured path.
    pub async fn call(
        &self,
        config: &EndpointConfig,
        api_key: Option<&str>,
        prompt: &str,
    ) -> Result<String, CallError> {
        let prepared = prepare_request(config, api_key, prompt)?;

        let mut request = self
            .http
            .post(prepared.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&prepared.body);
        for (name, value) in &prepared.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout(REQUEST_TIMEOUT)
            } else {
                CallError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| CallError::Http(e.to_string()))?;

        if !status.is_success() {
            let detail = if body_text.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {body_text}")
            };
            return Err(CallError::Http(detail));
        }

        let json: Value = serde_json::from_str(&body_text)
            .map_err(|e| CallError::Extraction(format!("response is not JSON: {e}")))?;

        extract_path(&json, &config.response_path)
    }
}

impl Default for EndpointCaller {
    fn default() -> Self {
        Self::new()
    }
}

/// Hydrate the template and apply key placement, without touching the
/// network. Split out so placement and hydration stay testable.
pub fn prepare_request(
    config: &EndpointConfig,
    api_key: Option<&str>,
    prompt: &str,
) -> Result<PreparedRequest, CallError> {
    let mut body: Value = serde_json::from_str(&config.request_template)
        .map_err(|e| CallError::Template(format!("template is not valid JSON: {e}")))?;

    let replaced = hydrate(&mut body, prompt);
    if replaced == 0 {
        return Err(CallError::Template(format!(
            "placeholder {PROMPT_PLACEHOLDER} not found anywhere in the template"
        )));
    }

    let mut url = Url::parse(&config.url)
        .map_err(|e| CallError::Config(format!("invalid endpoint url: {e}")))?;
    let mut headers: Vec<(String, String)> = Vec::new();

    if let Some(key) = api_key {
        let field = resolved_key_field(config);
        match config.key_placement {
            KeyPlacement::None => {}
            KeyPlacement::AuthHeader => {
                headers.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
            KeyPlacement::XApiKey => {
                headers.push((field.clone(), key.to_string()));
            }
            KeyPlacement::QueryParam => {
                url.query_pairs_mut().append_pair(&field, key);
            }
            KeyPlacement::BodyField => match body.as_object_mut() {
                Some(map) => {
                    map.insert(field.clone(), Value::String(key.to_string()));
                }
                None => {
                    return Err(CallError::Config(
                        "body_field key placement requires the hydrated body to be a JSON object"
                            .to_string(),
                    ));
                }
            },
        }

        // Providers like Anthropic and Google expect the key on a fixed
        // header even when the user routes it through the query or body.
        if config.key_placement != KeyPlacement::XApiKey
            && PROVIDER_KEY_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&field))
        {
            headers.push((field.to_lowercase(), key.to_string()));
        }
    }

    Ok(PreparedRequest { url, headers, body })
}

/// Default key field per placement, overridable via `key_field`.
fn resolved_key_field(config: &EndpointConfig) -> String {
    if let Some(field) = &config.key_field {
        return field.clone();
    }
    match config.key_placement {
        KeyPlacement::XApiKey => "x-api-key".to_string(),
        _ => "api_key".to_string(),
    }
}

/// Replace every occurrence of the placeholder in string values,
/// recursing through nested objects and arrays. Returns the number of
/// occurrences replaced.
fn hydrate(value: &mut Value, prompt: &str) -> usize {
    match value {
        Value::String(s) => {
            let count = s.matches(PROMPT_PLACEHOLDER).count();
            if count > 0 {
                *s = s.replace(PROMPT_PLACEHOLDER, prompt);
            }
            count
        }
        Value::Array(items) => items.iter_mut().map(|v| hydrate(v, prompt)).sum(),
        Value::Object(map) => map.values_mut().map(|v| hydrate(v, prompt)).sum(),
        _ => 0,
    }
}

/// Resolve a dotted/bracketed path expression like
/// `choices[0].message.content` against a JSON value. The resolved value
/// must be a string.
pub fn extract_path(json: &Value, path: &str) -> Result<String, CallError> {
    let mut current = json;

    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(CallError::Extraction(format!("empty segment in path '{path}'")));
        }

        let (name, indices) = split_indices(segment)
            .map_err(|e| CallError::Extraction(format!("bad path segment '{segment}': {e}")))?;

        if !name.is_empty() {
            current = current.get(name).ok_or_else(|| {
                CallError::Extraction(format!("path '{path}' did not resolve (missing '{name}')"))
            })?;
        }

        for idx in indices {
            current = current.get(idx).ok_or_else(|| {
                CallError::Extraction(format!("path '{path}' did not resolve (index {idx})"))
            })?;
        }
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        other => Err(CallError::Extraction(format!(
            "path '{path}' resolved to a non-string value: {other}"
        ))),
    }
}

/// Split `name[1][2]` into the field name and its bracket indices.
fn split_indices(segment: &str) -> Result<(&str, Vec<usize>), String> {
    let Some(bracket) = segment.find('[') else {
        return Ok((segment, Vec::new()));
    };

    let name = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];

    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err("expected '['".to_string());
        }
        let close = rest.find(']').ok_or_else(|| "unterminated '['".to_string())?;
        let idx: usize = rest[1..close]
            .parse()
            .map_err(|_| format!("non-numeric index '{}'", &rest[1..close]))?;
        indices.push(idx);
        rest = &rest[close + 1..];
    }

    Ok((name, indices))
}
