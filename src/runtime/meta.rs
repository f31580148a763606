use std::{fmt, path::PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// Runtime a portable plugin is written for. Unknown values are kept so a
/// descriptor always parses; they are rejected when the process is launched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    Go,
    Python,
    Other(String),
}

impl From<String> for Language {
    fn from(s: String) -> Self {
        match s.as_str() {
            "go" => Language::Go,
            "python" => Language::Python,
            _ => Language::Other(s),
        }
    }
}

impl From<Language> for String {
    fn from(lang: Language) -> Self {
        lang.to_string()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Go => f.write_str("go"),
            Language::Python => f.write_str("python"),
            Language::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VirtualEnvType {
    Conda,
    Other(String),
}

impl From<String> for VirtualEnvType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "conda" => VirtualEnvType::Conda,
            _ => VirtualEnvType::Other(s),
        }
    }
}

impl From<VirtualEnvType> for String {
    fn from(venv: VirtualEnvType) -> Self {
        venv.to_string()
    }
}

impl fmt::Display for VirtualEnvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtualEnvType::Conda => f.write_str("conda"),
            VirtualEnvType::Other(s) => f.write_str(s),
        }
    }
}

/// Descriptor of a portable plugin: what to run and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginMeta {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// `go` or `python`
    #[schemars(with = "String")]
    pub language: Language,
    pub executable: PathBuf,
    /// Only `conda` is supported. A blank value means no virtual env.
    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub virtual_env_type: Option<VirtualEnvType>,
    /// Name of the virtual environment to run in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<VirtualEnvType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(VirtualEnvType::from))
}

impl PluginMeta {
    pub fn new(name: impl Into<String>, language: Language, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            language,
            executable: executable.into(),
            virtual_env_type: None,
            env: None,
        }
    }
}
