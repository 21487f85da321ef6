//! Upstream provider configuration.

use secrecy::SecretString;
use serde::Deserialize;

/// The wire dialect an upstream provider speaks.
///
/// All kinds except [`ProviderKind::Gemini`] use the OpenAI-compatible
/// `/v1/chat/completions` surface and differ only in base URL and
/// credential conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI or any OpenAI-compatible endpoint.
    OpenAI,
    /// Alibaba Qwen via the DashScope compatible mode.
    Qwen,
    /// ModelScope inference endpoints (OpenAI-compatible).
    ModelScope,
    /// LM Studio running on localhost (OpenAI-compatible).
    LmStudio,
    /// Google Gemini with its wrapper envelope.
    Gemini,
}

impl ProviderKind {
    /// Whether this kind uses the OpenAI-compatible chat completions wire shape.
    pub fn is_openai_compatible(self) -> bool {
        !matches!(self, ProviderKind::Gemini)
    }

    /// Default base URL for the kind, used when `baseUrl` is omitted.
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com",
            ProviderKind::Qwen => "https://dashscope.aliyuncs.com/compatible-mode",
            ProviderKind::ModelScope => "https://api-inference.modelscope.cn",
            ProviderKind::LmStudio => "http://127.0.0.1:1234",
            ProviderKind::Gemini => "https://cloudcode-pa.googleapis.com",
        }
    }
}

/// Capability tag a configured model may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelCapability {
    /// Tuned for code generation and editing.
    Programming,
    /// Accepts image input.
    ImageProcessing,
    /// Large context window.
    LongContext,
    /// Extended reasoning / thinking modes.
    Reasoning,
}

/// A model declared on a provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ModelEntry {
    /// Model name as the provider expects it in requests.
    pub name: String,
    /// Output token ceiling for this model.
    pub max_tokens: u32,
    /// Optional capability tags used by routing.
    #[serde(default)]
    pub capabilities: Vec<ModelCapability>,
}

/// Configuration for one upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Human readable name. Falls back to the map key when omitted.
    #[serde(default)]
    pub name: Option<String>,

    /// Which wire dialect the provider speaks.
    pub kind: ProviderKind,

    /// Base URL. Kind-specific default applies when omitted.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Name of the environment variable holding the API key.
    ///
    /// Credentials never appear inline in the configuration file.
    #[serde(default)]
    pub credential_ref: Option<String>,

    /// Inline API key. Only intended for local providers such as LM Studio
    /// where the value is not a secret ("lm-studio").
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Declared models with their token ceilings.
    pub models: Vec<ModelEntry>,

    /// Relative weight for weighted balancing policies. Higher wins.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Priority rank; lower number means preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_priority() -> u32 {
    5
}

impl ProviderConfig {
    /// Resolved base URL with the trailing slash trimmed.
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Find a declared model by name.
    pub fn model(&self, name: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_defaults() {
        assert!(ProviderKind::Qwen.is_openai_compatible());
        assert!(!ProviderKind::Gemini.is_openai_compatible());
        assert_eq!(ProviderKind::LmStudio.default_base_url(), "http://127.0.0.1:1234");
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let provider: ProviderConfig = serde_json::from_str(
            r#"{ "kind": "openai", "baseUrl": "https://example.com/v1/", "models": [{ "name": "m", "maxTokens": 4096 }] }"#,
        )
        .unwrap();

        assert_eq!(provider.base_url(), "https://example.com/v1");
    }

    #[test]
    fn capabilities_parse_kebab_case() {
        let entry: ModelEntry = serde_json::from_str(
            r#"{ "name": "glm-4.5v", "maxTokens": 65536, "capabilities": ["image-processing", "long-context"] }"#,
        )
        .unwrap();

        assert_eq!(
            entry.capabilities,
            vec![ModelCapability::ImageProcessing, ModelCapability::LongContext]
        );
    }
}
