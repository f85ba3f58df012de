//! Turn orchestration.
//!
//! A turn is validated, enriched, assembled into a prompt and sent to the
//! generation service. Only after a reply is produced are the user turn
//! and the reply appended to the session log, in that order. The
//! conversation preview is updated last and its failure is not fatal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use parley_core::config::ChatConfig;
use parley_core::types::SummaryUpdate;

use crate::directory::SessionDirectory;
use crate::enrichment::{EnrichmentCoordinator, EnrichmentRequest};
use crate::error::ChatError;
use crate::prompt::PromptAssembler;
use crate::services::{GenerationParams, GenerationService};
use crate::session_log::SessionLog;

/// Preview shown for turns that carried only an attachment.
pub const ATTACHMENT_PREVIEW: &str = "Sent an attachment";

/// One inbound turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInput {
    #[serde(default)]
    pub message: String,
    pub session_id: String,
    /// Image as a data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// File as a data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl TurnInput {
    pub fn message(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    fn has_image(&self) -> bool {
        self.image.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    fn has_file(&self) -> bool {
        self.file.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    fn validate(&self) -> Result<(), ChatError> {
        if self.session_id.trim().is_empty() {
            return Err(ChatError::Validation("session id is required".to_string()));
        }
        if self.message.trim().is_empty() && !self.has_image() && !self.has_file() {
            return Err(ChatError::Validation(
                "a turn needs a message, an image, or a file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sequences enrichment, prompt assembly, generation and the commit of
/// one turn.
pub struct Orchestrator {
    session_log: Arc<SessionLog>,
    directory: Arc<SessionDirectory>,
    coordinator: EnrichmentCoordinator,
    assembler: PromptAssembler,
    generation: Arc<dyn GenerationService>,
    params: GenerationParams,
    preview_chars: usize,
    auto_register_sessions: bool,
}

impl Orchestrator {
    pub fn new(
        session_log: Arc<SessionLog>,
        directory: Arc<SessionDirectory>,
        coordinator: EnrichmentCoordinator,
        assembler: PromptAssembler,
        generation: Arc<dyn GenerationService>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            session_log,
            directory,
            coordinator,
            assembler,
            generation,
            params: GenerationParams {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            },
            preview_chars: config.preview_chars,
            auto_register_sessions: config.auto_register_sessions,
        }
    }

    pub fn session_log(&self) -> &Arc<SessionLog> {
        &self.session_log
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Run one turn and return the assistant reply.
    ///
    /// Nothing is appended to the session log unless generation succeeds.
    pub async fn run_turn(&self, input: TurnInput) -> Result<String, ChatError> {
        input.validate()?;
        let session_id = input.session_id.trim().to_string();
        let attachment_sent = input.has_image() || input.has_file();

        let request = EnrichmentRequest {
            message: input.message.clone(),
            image: input.image,
            file: input.file,
            file_name: input.file_name,
        };
        let bundle = self.coordinator.enrich(&request).await;

        let history = self.session_log.history(&session_id).await?;
        let prompt = self
            .assembler
            .assemble(&bundle, &input.message, &history, attachment_sent);
        debug!(
            session_id = %session_id,
            prompt_messages = prompt.len(),
            history = history.len(),
            "Prompt assembled"
        );

        let reply = self
            .generation
            .generate(&prompt, self.params)
            .await
            .map_err(|e| ChatError::Generation(e.to_string()))?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ChatError::Generation(
                "generation service returned no text".to_string(),
            ));
        }

        let user_turn = prompt
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_else(|| input.message.clone());
        self.session_log
            .append_turn(&session_id, &user_turn, reply)
            .await?;

        let preview = preview_text(&input.message, self.preview_chars);
        self.refresh_preview(&session_id, preview).await;

        info!(
            session_id = %session_id,
            reply_chars = reply.chars().count(),
            enriched = !bundle.is_empty(),
            "Turn completed"
        );
        Ok(reply.to_string())
    }

    /// Update the conversation preview. Failures are logged and ignored.
    async fn refresh_preview(&self, session_id: &str, preview: String) {
        let update = SummaryUpdate::preview(preview);
        let result = match self.directory.update(session_id, update.clone()).await {
            Err(ChatError::NotFound { .. }) if self.auto_register_sessions => {
                debug!(session_id, "Registering unknown conversation");
                match self
                    .directory
                    .create(Some(session_id.to_string()), None)
                    .await
                {
                    Ok(_) => self.directory.update(session_id, update).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        };
        if let Err(e) = result {
            warn!(session_id, error = %e, code = e.code(), "Conversation preview not updated");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("params", &self.params)
            .field("preview_chars", &self.preview_chars)
            .field("auto_register_sessions", &self.auto_register_sessions)
            .finish_non_exhaustive()
    }
}

/// Directory preview for a turn: the message capped at `max_chars`, or
/// [`ATTACHMENT_PREVIEW`] when the message was empty.
pub fn preview_text(message: &str, max_chars: usize) -> String {
    let message = message.trim();
    if message.is_empty() {
        return ATTACHMENT_PREVIEW.to_string();
    }
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", message[..cut].trim_end()),
        None => message.to_string(),
    }
}
