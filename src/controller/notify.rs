//! Status notifications to the API gateway. Best-effort: a failed
//! notification is logged and never fails the pipeline.

use std::collections::HashMap;

/// Environment variables controlling the notifications.
pub const ENDPOINT_ENV: &str = "CPIPES_STATUS_NOTIFICATION_ENDPOINT";
pub const ENDPOINT_JSON_ENV: &str = "CPIPES_STATUS_NOTIFICATION_ENDPOINT_JSON";
pub const START_TEMPLATE_ENV: &str = "CPIPES_START_NOTIFICATION_JSON";
pub const CUSTOM_FILE_KEYS_ENV: &str = "CPIPES_CUSTOM_FILE_KEY_NOTIFICATION";

/// Send the start notification if an endpoint is configured.
pub async fn notify_start(file_key: &str) {
    let endpoint = std::env::var(ENDPOINT_ENV).unwrap_or_default();
    let endpoint_json = std::env::var(ENDPOINT_JSON_ENV).unwrap_or_default();
    if endpoint.is_empty() && endpoint_json.is_empty() {
        return;
    }
    let custom_keys: Vec<String> = std::env::var(CUSTOM_FILE_KEYS_ENV)
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let template = std::env::var(START_TEMPLATE_ENV).unwrap_or_default();
    notify_api_gateway(file_key, &endpoint, &endpoint_json, &template, &custom_keys, "").await;
}

/// POST the notification template to the configured endpoint(s), with
/// `{key}` placeholders substituted from the file key's `k=v` components.
pub async fn notify_api_gateway(
    file_key: &str,
    endpoint: &str,
    endpoint_json: &str,
    template: &str,
    custom_file_keys: &[String],
    status: &str,
) {
    let components = file_key_components(file_key);
    let mut body = if template.is_empty() {
        serde_json::json!({"file_key": file_key, "status": status}).to_string()
    } else {
        template.to_string()
    };
    body = body.replace("{file_key}", file_key);
    body = body.replace("{status}", status);
    for key in custom_file_keys {
        if let Some(value) = components.get(key.as_str()) {
            body = body.replace(&format!("{{{key}}}"), value);
        }
    }

    let mut endpoints: Vec<String> = Vec::new();
    if !endpoint.is_empty() {
        endpoints.push(endpoint.to_string());
    }
    if !endpoint_json.is_empty() {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(endpoint_json) {
            for item in items {
                if let serde_json::Value::String(s) = item {
                    endpoints.push(s);
                }
            }
        }
    }

    let client = reqwest::Client::new();
    for url in endpoints {
        let outcome = client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body.clone())
            .send()
            .await;
        match outcome {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("notified api gateway at {}", url);
            }
            Ok(resp) => {
                tracing::warn!("api gateway at {} answered {}", url, resp.status());
            }
            Err(e) => {
                tracing::warn!("cannot notify api gateway at {}: {}", url, e);
            }
        }
    }
}

/// Parse the `k=v` path segments of a file key.
pub fn file_key_components(file_key: &str) -> HashMap<String, String> {
    let mut components = HashMap::new();
    for segment in file_key.split('/') {
        if let Some((k, v)) = segment.split_once('=') {
            components.insert(k.to_string(), v.to_string());
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_key_components_are_parsed() {
        let c = file_key_components("jetstore/input/client=acme/object_type=claims/f.csv");
        assert_eq!(c.get("client").map(String::as_str), Some("acme"));
        assert_eq!(c.get("object_type").map(String::as_str), Some("claims"));
        assert!(!c.contains_key("f.csv"));
    }
}
