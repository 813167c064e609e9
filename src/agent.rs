//! Agent variants the sandbox image can run.
//!
//! - OpenCode: reads `LLM_API_KEY` / `LLM_BASE_URL` / `OPENCODE_MODEL`
//! - Goose: speaks the OpenAI provider protocol via `OPENAI_*` variables
//!
//! The variant is chosen per session by the operator.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported agent runtimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentVariant {
    /// OpenCode agent.
    #[default]
    OpenCode,
    /// Goose agent.
    Goose,
}

impl AgentVariant {
    /// All supported variants.
    pub const ALL: [Self; 2] = [Self::OpenCode, Self::Goose];

    /// Builds the container environment for this variant, reading host
    /// settings through `lookup` (normally `std::env::var`).
    ///
    /// Unset host values are skipped rather than passed through empty.
    pub fn build_env<F>(self, lookup: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = BTreeMap::new();
        let mut copy = |to: &str, from: &str| {
            if let Some(value) = lookup(from).filter(|v| !v.is_empty()) {
                env.insert(to.to_string(), value);
            }
        };

        match self {
            Self::OpenCode => {
                copy("LLM_API_KEY", "LLM_API_KEY");
                copy("LLM_BASE_URL", "OPENCODE_LLM_HOST");
                copy("OPENCODE_MODEL", "OPENCODE_MODEL");
                copy("ITERATION_SLEEP", "ITERATION_SLEEP");
            }
            Self::Goose => {
                copy("OPENAI_API_KEY", "LLM_API_KEY");
                copy("OPENAI_HOST", "GOOSE_LLM_HOST");
                copy("GOOSE_MODEL", "GOOSE_MODEL");
                copy("ITERATION_SLEEP", "ITERATION_SLEEP");
                env.insert("GOOSE_PROVIDER".to_string(), "openai".to_string());
                env.insert("GOOSE_MODE".to_string(), "auto".to_string());
                env.insert("GOOSE_DISABLE_KEYRING".to_string(), "1".to_string());
            }
        }

        env
    }

    /// Builds the environment from the current process environment.
    pub fn env_from_process(self) -> BTreeMap<String, String> {
        self.build_env(|key| std::env::var(key).ok())
    }
}

impl std::fmt::Display for AgentVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenCode => write!(f, "opencode"),
            Self::Goose => write!(f, "goose"),
        }
    }
}

impl std::str::FromStr for AgentVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opencode" => Ok(Self::OpenCode),
            "goose" => Ok(Self::Goose),
            _ => anyhow::bail!("Unknown agent variant: '{s}'. Supported: opencode, goose"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_variant_display() {
        assert_eq!(format!("{}", AgentVariant::OpenCode), "opencode");
        assert_eq!(format!("{}", AgentVariant::Goose), "goose");
    }

    #[test]
    fn test_variant_from_str() {
        assert_eq!(
            "opencode".parse::<AgentVariant>().unwrap(),
            AgentVariant::OpenCode
        );
        assert_eq!("Goose".parse::<AgentVariant>().unwrap(), AgentVariant::Goose);
        assert!("cursor".parse::<AgentVariant>().is_err());
    }

    #[test]
    fn test_opencode_env() {
        let env = AgentVariant::OpenCode.build_env(lookup(&[
            ("LLM_API_KEY", "sk-test"),
            ("OPENCODE_LLM_HOST", "http://llm:8000/v1"),
            ("GOOSE_MODEL", "ignored"),
        ]));
        assert_eq!(env["LLM_API_KEY"], "sk-test");
        assert_eq!(env["LLM_BASE_URL"], "http://llm:8000/v1");
        assert!(!env.contains_key("OPENCODE_MODEL"));
        assert!(!env.contains_key("GOOSE_MODEL"));
    }

    #[test]
    fn test_goose_env_has_fixed_settings() {
        let env = AgentVariant::Goose.build_env(lookup(&[
            ("LLM_API_KEY", "sk-test"),
            ("GOOSE_MODEL", "qwen"),
            ("ITERATION_SLEEP", ""),
        ]));
        assert_eq!(env["OPENAI_API_KEY"], "sk-test");
        assert_eq!(env["GOOSE_MODEL"], "qwen");
        assert_eq!(env["GOOSE_PROVIDER"], "openai");
        assert_eq!(env["GOOSE_MODE"], "auto");
        assert_eq!(env["GOOSE_DISABLE_KEYRING"], "1");
        assert!(!env.contains_key("ITERATION_SLEEP"));
    }

    #[test]
    fn test_variant_serde() {
        let json = serde_json::to_string(&AgentVariant::OpenCode).unwrap();
        assert_eq!(json, "\"opencode\"");
        let parsed: AgentVariant = serde_json::from_str("\"goose\"").unwrap();
        assert_eq!(parsed, AgentVariant::Goose);
    }
}
