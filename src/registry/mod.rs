mod validate;

pub use validate::validate_args;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One argument of a tool.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub required: bool,
    /// Original validation pattern, kept for the list-tools schema
    pub pattern: Option<String>,
    pub validator: Option<Regex>,
}

/// How a tool maps onto an HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,

    /// Path template; `{arg}` segments are substituted and URL-encoded
    pub path: String,

    /// Args never placed in the request body (path-bound args are always
    /// excluded implicitly)
    #[serde(default)]
    pub body_exclude: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// How a tool's response is shaped before returning it to the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSpec {
    /// When set, the parsed body is returned as `{wrap: body}`
    #[serde(default)]
    pub wrap: Option<String>,
}

/// A fully compiled tool. Immutable after load.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub service: String,
    pub description: String,
    /// Signature template; defaults to the tool name alone
    pub signature_template: String,
    pub args: BTreeMap<String, ArgSpec>,
    pub request: RequestSpec,
    pub response: ResponseSpec,
}

/// Raw YAML shape of a service's tools file.
#[derive(Debug, Deserialize)]
struct ToolFile {
    tools: Vec<RawTool>,
}

#[derive(Debug, Deserialize)]
struct RawTool {
    name: String,

    #[serde(default)]
    description: String,

    #[serde(default)]
    signature: Option<String>,

    #[serde(default)]
    args: BTreeMap<String, RawArg>,

    request: RequestSpec,

    #[serde(default)]
    response: ResponseSpec,
}

#[derive(Debug, Deserialize)]
struct RawArg {
    #[serde(default)]
    required: bool,

    #[serde(default)]
    validate: Option<String>,
}

/// Tool entry as reported to agents by `list_tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub service: String,
    pub args: BTreeMap<String, ArgInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgInfo {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Registry of every tool the gateway will route. Exclusively owns the
/// definitions; immutable once the gateway starts.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Load a service's tools file (YAML, one file per service).
    ///
    /// Validator compile failures and cross-service name collisions are
    /// fatal configuration errors.
    pub fn load_service_file(&mut self, service: &str, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tools file: {}", path.display()))?;
        self.load_service_yaml(service, &content)
            .with_context(|| format!("in tools file: {}", path.display()))
    }

    /// Load tool definitions for a service from YAML text.
    pub fn load_service_yaml(&mut self, service: &str, yaml: &str) -> Result<usize> {
        let file: ToolFile =
            serde_yaml::from_str(yaml).context("failed to parse tool definitions")?;

        let count = file.tools.len();
        for raw in file.tools {
            let def = compile_tool(service, raw)?;
            self.register(def)?;
        }

        debug!(service, count, "loaded tool definitions");
        Ok(count)
    }

    /// Register a single compiled tool. Names must be globally unique
    /// across services.
    pub fn register(&mut self, def: ToolDefinition) -> Result<()> {
        if let Some(existing) = self.tools.get(&def.name) {
            anyhow::bail!(
                "duplicate tool name '{}' (services '{}' and '{}')",
                def.name,
                existing.service,
                def.service
            );
        }
        self.tools.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Look up a tool and the service that owns it.
    pub fn lookup(&self, tool_name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(tool_name).cloned()
    }

    /// Build the policy-matching signature for a request.
    ///
    /// Known tools substitute `{arg}` placeholders in their template. An
    /// undefined tool falls back to `tool_name(key=value, ...)` with keys
    /// in lexicographic order, so the result is deterministic either way.
    pub fn build_signature(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, Value>,
    ) -> String {
        match self.tools.get(tool_name) {
            Some(def) => interpolate(&def.signature_template, args),
            None => {
                let sorted: BTreeMap<&String, &Value> = args.iter().collect();
                let rendered: Vec<String> = sorted
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, stringify_scalar(v)))
                    .collect();
                format!("{}({})", tool_name, rendered.join(", "))
            }
        }
    }

    /// Everything the gateway routes, sorted by name. Used to answer the
    /// list-tools request.
    pub fn all_tools(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|def| ToolInfo {
                name: def.name.clone(),
                description: def.description.clone(),
                service: def.service.clone(),
                args: def
                    .args
                    .iter()
                    .map(|(name, spec)| {
                        (
                            name.clone(),
                            ArgInfo {
                                required: spec.required,
                                pattern: spec.pattern.clone(),
                            },
                        )
                    })
                    .collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tools owned by one service, for handing to its handler.
    pub fn tools_for_service(&self, service: &str) -> Vec<Arc<ToolDefinition>> {
        self.tools
            .values()
            .filter(|def| def.service == service)
            .cloned()
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_tool(service: &str, raw: RawTool) -> Result<ToolDefinition> {
    let mut args = BTreeMap::new();
    for (arg_name, raw_arg) in raw.args {
        let validator = match &raw_arg.validate {
            Some(pattern) => Some(Regex::new(pattern).with_context(|| {
                format!(
                    "invalid validator for {}.{}: '{}'",
                    raw.name, arg_name, pattern
                )
            })?),
            None => None,
        };
        args.insert(
            arg_name,
            ArgSpec {
                required: raw_arg.required,
                pattern: raw_arg.validate,
                validator,
            },
        );
    }

    let signature_template = raw.signature.unwrap_or_else(|| raw.name.clone());

    Ok(ToolDefinition {
        name: raw.name,
        service: service.to_string(),
        description: raw.description,
        signature_template,
        args,
        request: raw.request,
        response: raw.response,
    })
}

/// Substitute `{arg}` placeholders; an arg that is absent renders empty.
fn interpolate(template: &str, args: &serde_json::Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                if let Some(value) = args.get(key) {
                    out.push_str(&stringify_scalar(value));
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unclosed brace: emit the remainder literally
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Render a JSON scalar the way it appears in signatures and paths.
pub(crate) fn stringify_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HA_TOOLS: &str = r#"
tools:
  - name: ha_get_state
    description: Read the state of an entity
    signature: "ha_get_state({entity_id})"
    args:
      entity_id:
        required: true
        validate: "^[a-z_]+\\.[a-z0-9_.]+$"
    request:
      method: GET
      path: "/api/states/{entity_id}"
    response:
      wrap: state
  - name: ha_call_service
    description: Call a service on an entity
    signature: "ha_call_service({domain}.{service}, {entity_id})"
    args:
      domain:
        required: true
      service:
        required: true
      entity_id:
        required: true
    request:
      method: POST
      path: "/api/services/{domain}/{service}"
"#;

    fn args(pairs: &[(&str, &str)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn loads_yaml_definitions() {
        let mut registry = ToolRegistry::new();
        let count = registry
            .load_service_yaml("homeassistant", HA_TOOLS)
            .expect("load");
        assert_eq!(count, 2);

        let def = registry.lookup("ha_get_state").expect("tool exists");
        assert_eq!(def.service, "homeassistant");
        assert_eq!(def.request.method, "GET");
        assert!(def.args["entity_id"].validator.is_some());
    }

    #[test]
    fn signature_from_template() {
        let mut registry = ToolRegistry::new();
        registry
            .load_service_yaml("homeassistant", HA_TOOLS)
            .expect("load");

        let sig = registry.build_signature(
            "ha_call_service",
            &args(&[
                ("domain", "lock"),
                ("service", "unlock"),
                ("entity_id", "lock.front"),
            ]),
        );
        assert_eq!(sig, "ha_call_service(lock.unlock, lock.front)");
    }

    #[test]
    fn signature_is_deterministic() {
        let mut registry = ToolRegistry::new();
        registry
            .load_service_yaml("homeassistant", HA_TOOLS)
            .expect("load");

        let a = args(&[("entity_id", "sensor.t")]);
        let first = registry.build_signature("ha_get_state", &a);
        let second = registry.build_signature("ha_get_state", &a);
        assert_eq!(first, second);
        assert_eq!(first, "ha_get_state(sensor.t)");
    }

    #[test]
    fn fallback_signature_sorts_keys() {
        let registry = ToolRegistry::new();
        let sig = registry.build_signature("unknown_tool", &args(&[("b", "2"), ("a", "1")]));
        assert_eq!(sig, "unknown_tool(a=1, b=2)");
    }

    #[test]
    fn missing_template_defaults_to_name() {
        let mut registry = ToolRegistry::new();
        registry
            .load_service_yaml(
                "svc",
                "tools:\n  - name: plain\n    request:\n      path: \"/x\"\n",
            )
            .expect("load");
        assert_eq!(registry.build_signature("plain", &args(&[])), "plain");
    }

    #[test]
    fn name_collision_across_services_is_fatal() {
        let mut registry = ToolRegistry::new();
        let yaml = "tools:\n  - name: dup\n    request:\n      path: \"/x\"\n";
        registry.load_service_yaml("one", yaml).expect("first load");
        assert!(registry.load_service_yaml("two", yaml).is_err());
    }

    #[test]
    fn bad_validator_is_fatal() {
        let mut registry = ToolRegistry::new();
        let yaml = r#"
tools:
  - name: broken
    args:
      x:
        validate: "("
    request:
      path: "/x"
"#;
        assert!(registry.load_service_yaml("svc", yaml).is_err());
    }

    #[test]
    fn numeric_args_stringify_without_quotes() {
        let registry = ToolRegistry::new();
        let mut map = serde_json::Map::new();
        map.insert("level".to_string(), json!(5));
        map.insert("on".to_string(), json!(true));
        let sig = registry.build_signature("set", &map);
        assert_eq!(sig, "set(level=5, on=true)");
    }
}
