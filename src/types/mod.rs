use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}


/// Message content: plain text, or an opaque structured value (content parts)
/// that is forwarded as-is where the vendor accepts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Value),
}

impl MessageContent {
    /// Flattens the content into text. Structured parts contribute their `text`
    /// fields; anything else is rendered as JSON.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(text) => Some(text.as_str()),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Parts(Value::String(text)) => text.clone(),
            Self::Parts(other) => other.to_string(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(stop) => vec![stop.clone()],
            Self::Many(stops) => stops.clone(),
        }
    }
}

/// Inbound chat-completions request in the OpenAI wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            stream: false,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.model.trim().is_empty() {
            return Err("model must not be empty");
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty");
        }
        Ok(())
    }

    /// Splits off the leading run of system messages, joined by blank lines.
    /// System messages after the first non-system message are returned in
    /// place, for the caller to fold into its own role mapping.
    pub fn split_leading_system(&self) -> (Option<String>, &[ChatMessage]) {
        let leading = self
            .messages
            .iter()
            .take_while(|message| message.role == Role::System)
            .count();
        if leading == 0 {
            return (None, &self.messages);
        }
        let system = self.messages[..leading]
            .iter()
            .map(|message| message.content.to_text())
            .collect::<Vec<_>>()
            .join("\n\n");
        (Some(system), &self.messages[leading..])
    }
}

/// Token counts recovered from a vendor response, plus the raw payload they
/// were read from.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageResult {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub raw: Value,
}

impl UsageResult {
    pub fn new(input_tokens: u64, output_tokens: u64, raw: Value) -> Self {
        Self {
            input_tokens,
            output_tokens,
            raw,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn to_chat_usage(&self) -> Value {
        json!({
            "prompt_tokens": self.input_tokens,
            "completion_tokens": self.output_tokens,
            "total_tokens": self.total_tokens(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_stop_as_string_or_list() {
        let single: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END",
        }))
        .expect("single stop");
        assert_eq!(single.stop, Some(StopSequences::One("END".to_string())));
        assert!(!single.stream);

        let many: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": ["a", "b"],
            "stream": true,
        }))
        .expect("stop list");
        assert_eq!(
            many.stop.as_ref().map(StopSequences::to_vec),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(many.stream);
    }

    #[test]
    fn structured_content_is_kept_opaque() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "look"}, {"type": "image_url", "image_url": {"url": "x"}}],
        }))
        .expect("parts");
        assert!(matches!(message.content, MessageContent::Parts(_)));
        assert_eq!(message.content.to_text(), "look");
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let request = ChatCompletionRequest::new("gpt-4o", Vec::new());
        assert_eq!(request.validate(), Err("messages must not be empty"));
    }

    #[test]
    fn split_leading_system_joins_only_the_leading_run() {
        let request = ChatCompletionRequest::new(
            "claude-haiku-4-5",
            vec![
                ChatMessage::system("a"),
                ChatMessage::system("b"),
                ChatMessage::user("hi"),
                ChatMessage::system("late"),
            ],
        );
        let (system, rest) = request.split_leading_system();
        assert_eq!(system.as_deref(), Some("a\n\nb"));
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].role, Role::System);
    }
}
