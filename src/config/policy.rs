use anyhow::Result;
use glob::Pattern;
use serde::{Deserialize, Serialize};

/// What a matching policy entry does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Ask,
}

/// Outcome of evaluating a signature against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Ask => write!(f, "ask"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "ask" => Ok(Self::Ask),
            "deny" => Ok(Self::Deny),
            _ => anyhow::bail!("invalid decision '{}' (expected: allow, ask, deny)", s),
        }
    }
}

/// A single policy entry matching signatures by glob pattern.
///
/// Patterns use glob semantics: `*` any run, `?` single char, `[...]`
/// character class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PolicyRule {
    fn matches(&self, signature: &str) -> bool {
        // Patterns are verified at load; an unparseable pattern never matches.
        Pattern::new(&self.pattern)
            .map(|p| p.matches(signature))
            .unwrap_or(false)
    }
}

/// Security policy: explicit overrides first, fallback patterns second.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Explicit overrides, evaluated with deny > allow > ask precedence
    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    /// Fallback patterns, evaluated in declaration order
    #[serde(default)]
    pub defaults: Vec<PolicyRule>,
}

impl Policy {
    /// Verify every pattern compiles. Called once at startup; a bad
    /// pattern is a fatal configuration error.
    pub fn validate(&self) -> Result<()> {
        for rule in self.rules.iter().chain(self.defaults.iter()) {
            Pattern::new(&rule.pattern)
                .map_err(|e| anyhow::anyhow!("invalid policy pattern '{}': {}", rule.pattern, e))?;
        }
        Ok(())
    }

    /// Evaluate a signature.
    ///
    /// Precedence: any matching deny rule wins outright, then allow rules,
    /// then ask rules, then the first matching default, then ASK. A broad
    /// deny over a narrow allow still denies.
    pub fn evaluate(&self, signature: &str) -> Decision {
        for action in [Action::Deny, Action::Allow, Action::Ask] {
            if self
                .rules
                .iter()
                .any(|r| r.action == action && r.matches(signature))
            {
                return action.into();
            }
        }

        for rule in &self.defaults {
            if rule.matches(signature) {
                return rule.action.into();
            }
        }

        Decision::Ask
    }
}

impl From<Action> for Decision {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => Decision::Allow,
            Action::Deny => Decision::Deny,
            Action::Ask => Decision::Ask,
        }
    }
}
