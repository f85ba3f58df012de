//! Prompt assembly.
//!
//! Output layout: one system message, then up to `history_window` stored
//! messages in their original order, then the current user turn.

use chrono::{DateTime, Local};

use parley_core::types::{Message, PromptMessage, Role};

use crate::enrichment::EnrichmentBundle;

/// Default number of stored messages sent along with a turn.
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

const SYSTEM_DIRECTIVE: &str = "You are a helpful, knowledgeable assistant. When the user \
     shares an image or a file, its extracted content is included directly in their message \
     under labeled sections, so you can see it and should analyze it directly. Never claim \
     that you are unable to view images or files.";

const ANALYZE_UPLOAD: &str = "Please analyze what I uploaded.";
const UNREADABLE_UPLOAD: &str = "I uploaded an attachment, but its content could not be read.";
const GREETING: &str = "Hello!";

/// Builds the ordered message list for a generation call.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    history_window: usize,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

impl PromptAssembler {
    pub fn new(history_window: usize) -> Self {
        Self { history_window }
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Assemble the prompt using the current local time.
    pub fn assemble(
        &self,
        bundle: &EnrichmentBundle,
        message: &str,
        history: &[Message],
        attachment_sent: bool,
    ) -> Vec<PromptMessage> {
        self.assemble_at(bundle, message, history, attachment_sent, Local::now())
    }

    /// Assemble the prompt as of `now`.
    pub fn assemble_at(
        &self,
        bundle: &EnrichmentBundle,
        message: &str,
        history: &[Message],
        attachment_sent: bool,
        now: DateTime<Local>,
    ) -> Vec<PromptMessage> {
        let recent = &history[history.len().saturating_sub(self.history_window)..];

        let mut prompt = Vec::with_capacity(recent.len() + 2);
        prompt.push(PromptMessage::new(
            Role::System,
            system_message(bundle.external_context.as_deref(), now),
        ));
        prompt.extend(recent.iter().map(PromptMessage::from));
        prompt.push(PromptMessage::new(
            Role::User,
            user_turn(bundle, message, attachment_sent),
        ));
        prompt
    }
}

fn system_message(external_context: Option<&str>, now: DateTime<Local>) -> String {
    let mut text = format!(
        "{}\n\nCurrent date and time: {}",
        SYSTEM_DIRECTIVE,
        now.format("%A, %B %-d, %Y %H:%M")
    );
    if let Some(external) = external_context.filter(|e| !e.trim().is_empty()) {
        text.push_str("\n\nReal-time information:\n");
        text.push_str(external);
    }
    text
}

/// The current user turn. Never empty.
pub fn user_turn(bundle: &EnrichmentBundle, message: &str, attachment_sent: bool) -> String {
    let message = message.trim();

    if !bundle.has_attachment_context() {
        return if !message.is_empty() {
            message.to_string()
        } else if attachment_sent {
            UNREADABLE_UPLOAD.to_string()
        } else {
            GREETING.to_string()
        };
    }

    let mut sections = Vec::with_capacity(3);
    if let Some(image) = &bundle.image_context {
        sections.push(format!("[Image Analysis]\n{}", image));
    }
    if let Some(file) = &bundle.file_context {
        sections.push(format!("[File Content]\n{}", file));
    }
    let question = if message.is_empty() {
        ANALYZE_UPLOAD
    } else {
        message
    };
    sections.push(format!("[User's Question]\n{}", question));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::now(role, format!("m{}", i))
            })
            .collect()
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_three_history_plus_hi() {
        let assembler = PromptAssembler::default();
        let prompt = assembler.assemble(&EnrichmentBundle::default(), "hi", &history(3), false);

        assert_eq!(prompt.len(), 5);
        assert_eq!(prompt[0].role, Role::System);
        assert_eq!(prompt[1].content, "m0");
        assert_eq!(prompt[2].content, "m1");
        assert_eq!(prompt[2].role, Role::Assistant);
        assert_eq!(prompt[3].content, "m2");
        assert_eq!(prompt[4], PromptMessage::new(Role::User, "hi"));
    }

    #[test]
    fn test_history_is_capped_to_most_recent() {
        let assembler = PromptAssembler::default();
        let prompt = assembler.assemble(&EnrichmentBundle::default(), "q", &history(50), false);

        assert_eq!(prompt.len(), 12);
        assert_eq!(prompt[1].content, "m40");
        assert_eq!(prompt[10].content, "m49");
    }

    #[test]
    fn test_custom_window() {
        let assembler = PromptAssembler::new(2);
        let prompt = assembler.assemble(&EnrichmentBundle::default(), "q", &history(5), false);
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[1].content, "m3");
    }

    #[test]
    fn test_system_message_carries_time_and_external_context() {
        let bundle = EnrichmentBundle {
            external_context: Some("Weather in Oslo: snow".to_string()),
            ..EnrichmentBundle::default()
        };
        let prompt = PromptAssembler::default().assemble_at(&bundle, "hi", &[], false, fixed_now());

        let system = &prompt[0].content;
        assert!(system.starts_with(SYSTEM_DIRECTIVE));
        assert!(system.contains("Tuesday, March 5, 2024 14:30"));
        assert!(system.ends_with("Weather in Oslo: snow"));
        assert_eq!(prompt.len(), 2);
    }

    #[test]
    fn test_system_message_without_external_context() {
        let prompt = PromptAssembler::default().assemble_at(
            &EnrichmentBundle::default(),
            "hi",
            &[],
            false,
            fixed_now(),
        );
        assert!(!prompt[0].content.contains("Real-time information"));
    }

    #[test]
    fn test_labeled_sections_in_order() {
        let bundle = EnrichmentBundle {
            image_context: Some("a cat".to_string()),
            file_context: Some("notes".to_string()),
            external_context: None,
        };
        let turn = user_turn(&bundle, "What is this?", true);
        assert_eq!(
            turn,
            "[Image Analysis]\na cat\n\n[File Content]\nnotes\n\n[User's Question]\nWhat is this?"
        );
    }

    #[test]
    fn test_attachment_without_question() {
        let bundle = EnrichmentBundle {
            file_context: Some("notes".to_string()),
            ..EnrichmentBundle::default()
        };
        let turn = user_turn(&bundle, "  ", true);
        assert!(turn.starts_with("[File Content]"));
        assert!(turn.ends_with(ANALYZE_UPLOAD));
    }

    #[test]
    fn test_user_turn_is_never_empty() {
        let empty = EnrichmentBundle::default();
        assert_eq!(user_turn(&empty, "", false), GREETING);
        assert_eq!(user_turn(&empty, "", true), UNREADABLE_UPLOAD);
        assert_eq!(user_turn(&empty, "plain", true), "plain");
    }

    #[test]
    fn test_external_context_alone_keeps_raw_message() {
        let bundle = EnrichmentBundle {
            external_context: Some("news".to_string()),
            ..EnrichmentBundle::default()
        };
        assert_eq!(user_turn(&bundle, "latest news?", false), "latest news?");
    }
}
