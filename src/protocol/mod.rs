//! Wire protocols spoken by callers and upstreams, and the converters
//! between them.

pub mod claude;
pub mod ollama;

use serde::{Deserialize, Serialize};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const MESSAGES_PATH: &str = "/v1/messages";
pub const MODELS_PATH: &str = "/v1/models";
pub const OLLAMA_TAGS_PATH: &str = "/api/tags";
pub const OLLAMA_SHOW_PATH: &str = "/api/show";
pub const OLLAMA_VERSION_PATH: &str = "/api/version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Openai,
    Claude,
    Ollama,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Openai => "openai",
            Protocol::Claude => "claude",
            Protocol::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Protocol::Openai),
            "claude" | "anthropic" => Ok(Protocol::Claude),
            "ollama" => Ok(Protocol::Ollama),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// Paths whose JSON body names a model that may be aliased.
pub fn is_model_bearing(path: &str) -> bool {
    path.ends_with(CHAT_COMPLETIONS_PATH) || path.ends_with(MESSAGES_PATH)
}
