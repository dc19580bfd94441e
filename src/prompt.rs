//! Chat prompts, stored as TOML and rendered with Handlebars.
//!
//! ```toml
//! developer = "You are a resume analysis expert."
//!
//! [[messages]]
//! user = """
//! Extract the fields from this resume:
//!
//! {{text}}
//! """
//! ```

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs,
};
use handlebars::{Handlebars, no_escape};

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// A chat completion prompt.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// User messages, in order.
    pub messages: Vec<Message>,
}

/// A single user message template.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Message {
    pub user: String,
}

impl ChatPrompt {
    /// Load a prompt from a TOML or JSON file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let prompt = read_json_or_toml::<Self>(path).await?;
        prompt.check()?;
        Ok(prompt)
    }

    /// Parse a built-in TOML prompt.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let prompt = toml::from_str::<Self>(toml).context("failed to parse prompt")?;
        prompt.check()?;
        Ok(prompt)
    }

    /// Make sure the prompt is usable.
    fn check(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(anyhow!("prompt must contain at least one user message"));
        }
        Ok(())
    }

    /// Render all templates, producing chat messages.
    ///
    /// Output is not HTML-escaped: résumé text is full of `&` and `<`.
    pub fn render(&self, bindings: &Value) -> Result<Vec<RenderedMessage>> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(no_escape);
        handlebars.set_strict_mode(true);

        let mut rendered = Vec::with_capacity(self.messages.len() + 1);
        if let Some(developer) = &self.developer {
            rendered.push(RenderedMessage::Developer(
                handlebars
                    .render_template(developer, bindings)
                    .context("failed to render developer message")?,
            ));
        }
        for (idx, message) in self.messages.iter().enumerate() {
            rendered.push(RenderedMessage::User(
                handlebars
                    .render_template(&message.user, bindings)
                    .with_context(|| format!("failed to render user message {}", idx))?,
            ));
        }
        Ok(rendered)
    }
}

/// A message after template expansion.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderedMessage {
    Developer(String),
    User(String),
}

/// Convert rendered messages to `async-openai` request messages.
pub fn to_openai_messages(
    messages: &[RenderedMessage],
) -> Result<Vec<ChatCompletionRequestMessage>> {
    messages
        .iter()
        .map(|message| -> Result<ChatCompletionRequestMessage> {
            Ok(match message {
                RenderedMessage::Developer(content) => {
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(content.as_str())
                        .build()
                        .context("failed to build system message")?
                        .into()
                }
                RenderedMessage::User(content) => {
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content.as_str())
                        .build()
                        .context("failed to build user message")?
                        .into()
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = r#"
developer = "You extract {{kind}}."

[[messages]]
user = "Resume:\n{{text}}"
"#;

    #[test]
    fn renders_without_escaping() {
        let prompt = ChatPrompt::from_toml_str(PROMPT).unwrap();
        let rendered = prompt
            .render(&json!({ "kind": "fields", "text": "R&D <lead>" }))
            .unwrap();
        assert_eq!(
            rendered,
            vec![
                RenderedMessage::Developer("You extract fields.".to_owned()),
                RenderedMessage::User("Resume:\nR&D <lead>".to_owned()),
            ]
        );
        assert_eq!(to_openai_messages(&rendered).unwrap().len(), 2);
    }

    #[test]
    fn missing_bindings_are_errors() {
        let prompt = ChatPrompt::from_toml_str(PROMPT).unwrap();
        assert!(prompt.render(&json!({ "kind": "fields" })).is_err());
    }

    #[test]
    fn prompts_need_a_user_message() {
        assert!(ChatPrompt::from_toml_str("developer = \"hi\"\nmessages = []").is_err());
    }
}
