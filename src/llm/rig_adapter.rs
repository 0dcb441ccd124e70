//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ResponseFormat,
    Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's (preamble, history, prompt) shape.
///
/// System messages are joined into the preamble; the final user message is the
/// prompt and everything between becomes chat history.
fn split_messages(
    messages: &[ChatMessage],
    format: &ResponseFormat,
) -> Result<(Option<String>, Vec<Message>, String), LlmError> {
    let mut preamble: Vec<String> = Vec::new();
    let mut turns: Vec<&ChatMessage> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => preamble.push(msg.content.clone()),
            Role::User | Role::Assistant => turns.push(msg),
        }
    }

    if let ResponseFormat::Json { schema } = format {
        let mut hint = "Respond with a single JSON object and nothing else.".to_string();
        if let Some(schema) = schema {
            hint.push_str(&format!(" It must conform to this JSON schema: {schema}"));
        }
        preamble.push(hint);
    }

    let prompt = match turns.pop() {
        Some(last) if last.role == Role::User => last.content.clone(),
        _ => {
            return Err(LlmError::RequestFailed {
                provider: "rig".to_string(),
                reason: "completion request must end with a user message".to_string(),
            });
        }
    };

    let history = turns
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => Message::assistant(m.content.clone()),
            _ => Message::user(m.content.clone()),
        })
        .collect();

    let preamble = if preamble.is_empty() {
        None
    } else {
        Some(preamble.join("\n\n"))
    };
    Ok((preamble, history, prompt))
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) =
            split_messages(&request.messages, &request.response_format)?;

        let mut builder = self
            .model
            .completion_request(Message::user(prompt))
            .messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "response contained no text".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_joins_system_messages_into_preamble() {
        let messages = vec![
            ChatMessage::system("You extract meetings."),
            ChatMessage::system("Be brief."),
            ChatMessage::user("Can we meet Tuesday?"),
        ];
        let (preamble, history, prompt) = split_messages(&messages, &ResponseFormat::Text).unwrap();
        let preamble = preamble.unwrap();
        assert!(preamble.contains("You extract meetings."));
        assert!(preamble.contains("Be brief."));
        assert!(history.is_empty());
        assert_eq!(prompt, "Can we meet Tuesday?");
    }

    #[test]
    fn split_keeps_history_before_prompt() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ];
        let (preamble, history, prompt) = split_messages(&messages, &ResponseFormat::Text).unwrap();
        assert!(preamble.is_none());
        assert_eq!(history.len(), 2);
        assert_eq!(prompt, "second");
    }

    #[test]
    fn split_adds_json_hint() {
        let messages = vec![ChatMessage::user("x")];
        let format = ResponseFormat::Json {
            schema: Some(serde_json::json!({"type": "object"})),
        };
        let (preamble, _, _) = split_messages(&messages, &format).unwrap();
        let preamble = preamble.unwrap();
        assert!(preamble.contains("JSON object"));
        assert!(preamble.contains("\"type\""));
    }

    #[test]
    fn split_rejects_trailing_assistant_message() {
        let messages = vec![ChatMessage::user("q"), ChatMessage::assistant("a")];
        assert!(split_messages(&messages, &ResponseFormat::Text).is_err());
    }
}
