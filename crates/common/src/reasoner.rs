use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Opaque language-model collaborator used by the analysis pipeline.
///
/// The reasoner's text is advisory narrative only: signals, confidence and
/// risk scores are always computed from numeric indicators, never parsed
/// out of this output.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String>;
}
