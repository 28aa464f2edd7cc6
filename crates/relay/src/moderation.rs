//! Content moderation applied before a request is dispatched.

use async_trait::async_trait;
use config::ModerationConfig;

use crate::{
    error::{RelayError, RelayResult},
    messages::unified::{UnifiedChatRequest, UnifiedRole},
};

/// The outcome of a moderation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Rejected { reason: String, code: String },
}

/// Checks request text against a content policy.
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn check(&self, content: &str) -> RelayResult<Verdict>;
}

/// Lets everything through.
pub struct AllowAll;

#[async_trait]
impl Moderator for AllowAll {
    async fn check(&self, _: &str) -> RelayResult<Verdict> {
        Ok(Verdict::Safe)
    }
}

/// Rejects content containing any of a list of terms, ignoring case.
pub struct KeywordModerator {
    blocked_terms: Vec<String>,
}

impl KeywordModerator {
    pub fn new(blocked_terms: &[String]) -> Self {
        let blocked_terms = blocked_terms
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();

        Self { blocked_terms }
    }
}

#[async_trait]
impl Moderator for KeywordModerator {
    async fn check(&self, content: &str) -> RelayResult<Verdict> {
        let content = content.to_lowercase();

        let verdict = match self.blocked_terms.iter().find(|term| content.contains(term.as_str())) {
            Some(term) => Verdict::Rejected {
                reason: format!("the request contains the blocked term '{term}'"),
                code: "blocked_term".to_string(),
            },
            None => Verdict::Safe,
        };

        Ok(verdict)
    }
}

/// The moderator configured for the relay.
pub(crate) fn from_config(config: &ModerationConfig) -> Box<dyn Moderator> {
    if config.enabled {
        Box::new(KeywordModerator::new(&config.blocked_terms))
    } else {
        Box::new(AllowAll)
    }
}

/// Checks every piece of text in `request`, system prompts included.
pub(crate) async fn moderate(moderator: &dyn Moderator, request: &UnifiedChatRequest) -> RelayResult<()> {
    let content = request
        .system_prompts()
        .chain(
            request
                .messages
                .iter()
                .filter(|message| message.role != UnifiedRole::System)
                .flat_map(|message| message.content.texts()),
        )
        .collect::<Vec<_>>()
        .join("\n");

    match moderator.check(&content).await? {
        Verdict::Safe => Ok(()),
        Verdict::Rejected { reason, code } => {
            log::debug!("Request for model {} rejected by moderation: {reason}", request.model);
            Err(RelayError::ContentPolicy { reason, code })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{SystemInstruction, UnifiedMessage};

    fn request(system: &str, user: &str) -> UnifiedChatRequest {
        UnifiedChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![UnifiedMessage::text(UnifiedRole::User, user)],
            system: Some(SystemInstruction::Text(system.to_string())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn blocked_terms_ignore_case() {
        let moderator = KeywordModerator::new(&["Forbidden".to_string(), " ".to_string()]);

        let verdict = moderator.check("this is FORBIDDEN knowledge").await.unwrap();

        assert_eq!(
            verdict,
            Verdict::Rejected {
                reason: "the request contains the blocked term 'forbidden'".to_string(),
                code: "blocked_term".to_string(),
            }
        );

        assert_eq!(moderator.check("harmless").await.unwrap(), Verdict::Safe);
    }

    #[tokio::test]
    async fn system_prompts_are_moderated_too() {
        let moderator = KeywordModerator::new(&["forbidden".to_string()]);

        let error = moderate(&moderator, &request("forbidden instructions", "hello"))
            .await
            .unwrap_err();

        insta::assert_snapshot!(error, @"Content policy violation: the request contains the blocked term 'forbidden'");
        assert!(moderate(&moderator, &request("be nice", "hello")).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_moderation_allows_everything() {
        let config = ModerationConfig {
            enabled: false,
            blocked_terms: vec!["hello".to_string()],
        };

        assert!(moderate(from_config(&config).as_ref(), &request("", "hello")).await.is_ok());
    }
}
