//! Vendor adapters. Each one translates the unified chat-completions protocol
//! into one vendor's wire format and back.

mod anthropic;
mod google;
mod openai_compatible;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use anthropic::Anthropic;
pub use google::Google;
pub use openai_compatible::OpenAiCompatible;
pub use stream::{FrameStream, StreamFrame};

use crate::Result;
use crate::types::{ChatCompletionRequest, UsageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Xai,
    Anthropic,
    Google,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Xai => "xai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &[
                "gpt-4o",
                "gpt-4o-mini",
                "gpt-4.1",
                "gpt-4.1-mini",
                "gpt-4.1-nano",
            ],
            Self::Xai => &["grok-3", "grok-3-mini", "grok-2"],
            Self::Anthropic => &[
                "claude-sonnet-4-20250514",
                "claude-haiku-4-5",
                "claude-opus-4-5",
            ],
            Self::Google => &["gemini-2.0-flash", "gemini-3-flash"],
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter resolution order; the first adapter whose model set contains the
/// requested model wins.
pub const ADAPTER_ORDER: [ProviderKind; 4] = [
    ProviderKind::OpenAi,
    ProviderKind::Xai,
    ProviderKind::Google,
    ProviderKind::Anthropic,
];

/// Decrypted vendor master credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// A non-streaming result: the unified `chat.completion` body and the token
/// counts read from the vendor response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: Value,
    pub usage: UsageResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub openai: String,
    pub xai: String,
    pub anthropic: String,
    pub google: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai: "https://api.openai.com/v1".to_string(),
            xai: "https://api.x.ai/v1".to_string(),
            anthropic: "https://api.anthropic.com".to_string(),
            google: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

impl ProviderEndpoints {
    /// Points every vendor at the same base URL, for tests against a mock.
    pub fn all(base_url: &str) -> Self {
        Self {
            openai: base_url.to_string(),
            xai: base_url.to_string(),
            anthropic: base_url.to_string(),
            google: base_url.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ProviderAdapter {
    OpenAi(OpenAiCompatible),
    Xai(OpenAiCompatible),
    Anthropic(Anthropic),
    Google(Google),
}

impl ProviderAdapter {
    pub fn new(kind: ProviderKind, http: reqwest::Client, endpoints: &ProviderEndpoints) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::OpenAi(OpenAiCompatible::new(
                kind,
                http,
                endpoints.openai.clone(),
            )),
            ProviderKind::Xai => {
                Self::Xai(OpenAiCompatible::new(kind, http, endpoints.xai.clone()))
            }
            ProviderKind::Anthropic => {
                Self::Anthropic(Anthropic::new(http, endpoints.anthropic.clone()))
            }
            ProviderKind::Google => Self::Google(Google::new(http, endpoints.google.clone())),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::OpenAi(adapter) | Self::Xai(adapter) => adapter.kind(),
            Self::Anthropic(_) => ProviderKind::Anthropic,
            Self::Google(_) => ProviderKind::Google,
        }
    }

    pub fn supports(&self, model: &str) -> bool {
        self.kind().models().contains(&model)
    }

    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<Completion> {
        match self {
            Self::OpenAi(client) | Self::Xai(client) => client.complete(request, credential).await,
            Self::Anthropic(client) => client.complete(request, credential).await,
            Self::Google(client) => client.complete(request, credential).await,
        }
    }

    /// Opens the vendor stream. Fails before the first frame when the vendor
    /// rejects the request; later failures surface as an in-band error frame.
    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<FrameStream> {
        match self {
            Self::OpenAi(client) | Self::Xai(client) => client.stream(request, credential).await,
            Self::Anthropic(client) => client.stream(request, credential).await,
            Self::Google(client) => client.stream(request, credential).await,
        }
    }
}

/// The fixed, ordered set of adapters.
#[derive(Clone, Debug)]
pub struct AdapterRegistry {
    adapters: Vec<ProviderAdapter>,
}

impl AdapterRegistry {
    pub fn new(http: reqwest::Client, endpoints: &ProviderEndpoints) -> Self {
        let adapters = ADAPTER_ORDER
            .iter()
            .map(|kind| ProviderAdapter::new(*kind, http.clone(), endpoints))
            .collect();
        Self { adapters }
    }

    pub fn resolve(&self, model: &str) -> Option<&ProviderAdapter> {
        self.adapters.iter().find(|adapter| adapter.supports(model))
    }

    pub fn adapters(&self) -> &[ProviderAdapter] {
        &self.adapters
    }
}
