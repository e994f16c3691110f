use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DispatchError, ServiceHandler};
use crate::config::{HealthProbe, ServiceAuth, ServiceConfig};
use crate::error::ExecutionErrorKind;
use crate::registry::{ToolDefinition, stringify_scalar};

/// Connection timeout, separate from the per-service request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Generic HTTP executor for a service's tools.
pub struct HttpHandler {
    client: reqwest::Client,
    base_url: String,
    auth: Option<ServiceAuth>,
    errors: BTreeMap<u16, String>,
    health: HealthProbe,
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl HttpHandler {
    pub fn from_config(
        service: &str,
        config: &ServiceConfig,
        tools: Vec<Arc<ToolDefinition>>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("services.{}: failed to build HTTP client: {}", service, e))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
            errors: config.errors.clone(),
            health: config.health.clone().unwrap_or_default(),
            tools: tools
                .into_iter()
                .map(|def| (def.name.clone(), def))
                .collect(),
        })
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            None => builder,
            Some(ServiceAuth::Bearer { token }) => builder.bearer_auth(token),
            Some(ServiceAuth::Header { header, value }) => builder.header(header, value),
            Some(ServiceAuth::Query { param, value }) => {
                builder.query(&[(param.as_str(), value.as_str())])
            }
            Some(ServiceAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
        }
    }
}

#[async_trait]
impl ServiceHandler for HttpHandler {
    async fn execute(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let def = self.tools.get(tool_name).ok_or_else(|| {
            DispatchError::new(
                ExecutionErrorKind::Protocol,
                format!("tool '{}' is not routed to this service", tool_name),
            )
        })?;

        let (path, path_args) = interpolate_path(&def.request.path, args);
        let url = format!("{}{}", self.base_url, path);

        let method = reqwest::Method::from_bytes(def.request.method.to_uppercase().as_bytes())
            .map_err(|_| {
                DispatchError::new(
                    ExecutionErrorKind::Protocol,
                    format!("invalid HTTP method '{}'", def.request.method),
                )
            })?;
        let is_get = method == reqwest::Method::GET;

        let mut builder = self.client.request(method, &url);
        builder = self.apply_auth(builder);

        if !is_get {
            let body = build_body(def, args, &path_args);
            builder = builder.json(&body);
        }

        debug!(tool = tool_name, url = %url, "dispatching service request");

        let response = builder.send().await.map_err(|e| {
            DispatchError::new(
                ExecutionErrorKind::Connection,
                format!("request to service failed: {}", e),
            )
        })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| {
            DispatchError::new(
                ExecutionErrorKind::Connection,
                format!("failed to read service response: {}", e),
            )
        })?;

        if !status.is_success() {
            let message = match self.errors.get(&status.as_u16()) {
                Some(template) => render_error_template(template, status.as_u16(), &body_text),
                None => format!("service returned HTTP {}", status.as_u16()),
            };
            warn!(tool = tool_name, status = status.as_u16(), "service request failed");
            return Err(DispatchError::new(classify_status(status.as_u16()), message));
        }

        let parsed = if body_text.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&body_text) {
                Ok(value) => value,
                Err(_) if def.response.wrap.is_some() => {
                    return Err(DispatchError::new(
                        ExecutionErrorKind::Protocol,
                        "service returned a non-JSON body",
                    ));
                }
                Err(_) => Value::String(body_text),
            }
        };

        Ok(match &def.response.wrap {
            Some(key) => {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert(key.clone(), parsed);
                Value::Object(wrapped)
            }
            None => parsed,
        })
    }

    async fn health_check(&self) -> bool {
        let Ok(method) =
            reqwest::Method::from_bytes(self.health.method.to_uppercase().as_bytes())
        else {
            return false;
        };
        let url = format!("{}{}", self.base_url, self.health.path);

        let builder = self.apply_auth(self.client.request(method, &url));
        match builder.send().await {
            Ok(response) => match self.health.expected_status {
                Some(expected) => response.status().as_u16() == expected,
                None => response.status().is_success(),
            },
            Err(e) => {
                debug!(url = %url, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Substitute `{arg}` path segments, URL-encoding each value, and report
/// which args were bound into the path.
fn interpolate_path(
    template: &str,
    args: &serde_json::Map<String, Value>,
) -> (String, HashSet<String>) {
    let mut out = String::with_capacity(template.len());
    let mut bound = HashSet::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                if let Some(value) = args.get(key) {
                    out.push_str(&urlencoding::encode(&stringify_scalar(value)));
                    bound.insert(key.to_string());
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return (out, bound);
            }
        }
    }

    out.push_str(rest);
    (out, bound)
}

/// Request body for non-GET methods: every arg except the explicit
/// exclusions and anything already bound into the path.
fn build_body(
    def: &ToolDefinition,
    args: &serde_json::Map<String, Value>,
    path_args: &HashSet<String>,
) -> Value {
    let body: serde_json::Map<String, Value> = args
        .iter()
        .filter(|(name, _)| {
            !path_args.contains(*name) && !def.request.body_exclude.contains(name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Value::Object(body)
}

fn render_error_template(template: &str, status: u16, body: &str) -> String {
    template
        .replace("{status}", &status.to_string())
        .replace("{body}", body)
}

fn classify_status(status: u16) -> ExecutionErrorKind {
    match status {
        401 | 403 => ExecutionErrorKind::Auth,
        404 => ExecutionErrorKind::NotFound,
        _ => ExecutionErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolRegistry;
    use serde_json::json;

    fn sample_tool() -> Arc<ToolDefinition> {
        let mut registry = ToolRegistry::new();
        registry
            .load_service_yaml(
                "svc",
                r#"
tools:
  - name: call_service
    args:
      domain:
        required: true
      service:
        required: true
      entity_id:
        required: true
      trace:
        required: false
    request:
      method: POST
      path: "/api/services/{domain}/{service}"
      body_exclude: ["trace"]
"#,
            )
            .expect("load");
        registry.lookup("call_service").expect("tool")
    }

    fn args(pairs: &[(&str, &str)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn path_interpolation_url_encodes() {
        let (path, bound) = interpolate_path(
            "/api/states/{entity_id}",
            &args(&[("entity_id", "light/odd name")]),
        );
        assert_eq!(path, "/api/states/light%2Fodd%20name");
        assert!(bound.contains("entity_id"));
    }

    #[test]
    fn missing_path_arg_renders_empty() {
        let (path, bound) = interpolate_path("/api/{missing}/x", &args(&[]));
        assert_eq!(path, "/api//x");
        assert!(bound.is_empty());
    }

    #[test]
    fn body_excludes_path_bound_and_configured_args() {
        let def = sample_tool();
        let all = args(&[
            ("domain", "lock"),
            ("service", "unlock"),
            ("entity_id", "lock.front"),
            ("trace", "on"),
        ]);
        let (_, bound) = interpolate_path(&def.request.path, &all);

        let body = build_body(&def, &all, &bound);
        let body = body.as_object().expect("object");
        assert_eq!(body.len(), 1);
        assert_eq!(body["entity_id"], json!("lock.front"));
    }

    #[test]
    fn error_template_substitution() {
        let rendered =
            render_error_template("entity not found ({status}): {body}", 404, "no such thing");
        assert_eq!(rendered, "entity not found (404): no such thing");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401), ExecutionErrorKind::Auth);
        assert_eq!(classify_status(403), ExecutionErrorKind::Auth);
        assert_eq!(classify_status(404), ExecutionErrorKind::NotFound);
        assert_eq!(classify_status(500), ExecutionErrorKind::Other);
    }
}
