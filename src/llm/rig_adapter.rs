//! Bridges a rig-core `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

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

/// Split our message list into rig's shape: preamble, prior turns, and the
/// final user prompt.
fn split_messages(
    messages: &[ChatMessage],
) -> Result<(Option<String>, Vec<Message>, String), LlmError> {
    let mut preamble: Vec<&str> = Vec::new();
    let mut turns: Vec<&ChatMessage> = Vec::new();
    for message in messages {
        match message.role {
            Role::System => preamble.push(&message.content),
            Role::User | Role::Assistant => turns.push(message),
        }
    }

    let prompt = match turns.pop() {
        Some(last) if last.role == Role::User => last.content.clone(),
        _ => {
            return Err(LlmError::RequestFailed {
                provider: "rig".to_string(),
                reason: "request must end with a user message".to_string(),
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

    let preamble = (!preamble.is_empty()).then(|| preamble.join("\n\n"));
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
        let (preamble, history, prompt) = split_messages(&request.messages)?;

        let mut builder = self.model.completion_request(prompt).messages(history);
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

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let output_tokens = response.usage.output_tokens as u32;
        let finish_reason = match request.max_tokens {
            Some(max) if output_tokens >= max => FinishReason::Length,
            _ if content.is_empty() => FinishReason::Unknown,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_moves_system_into_preamble() {
        let (preamble, history, prompt) = split_messages(&[
            ChatMessage::system("You are Agent Sig."),
            ChatMessage::user("earlier"),
            ChatMessage::assistant("noted"),
            ChatMessage::user("analyze this"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("You are Agent Sig."));
        assert_eq!(history.len(), 2);
        assert_eq!(prompt, "analyze this");
    }

    #[test]
    fn split_requires_trailing_user_message() {
        assert!(split_messages(&[ChatMessage::system("only system")]).is_err());
        assert!(split_messages(&[ChatMessage::user("q"), ChatMessage::assistant("a")]).is_err());
    }
}
