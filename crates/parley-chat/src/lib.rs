//! Conversation orchestration for Parley.
//!
//! Runs one assistant turn end to end: concurrent enrichment of the
//! turn's attachments and side lookups, prompt assembly over a bounded
//! slice of history, the generation call, and the commit of the turn to
//! the per-conversation log and the global conversation directory.

pub mod attachment;
pub mod directory;
pub mod enrichment;
pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod prompt;
pub mod services;
pub mod session_log;

pub use directory::SessionDirectory;
pub use enrichment::{EnrichmentBundle, EnrichmentCoordinator, EnrichmentRequest};
pub use error::{ChatError, EnrichmentFailure, FailureReport};
pub use intent::LookupIntent;
pub use orchestrator::{Orchestrator, TurnInput};
pub use prompt::PromptAssembler;
pub use services::{
    ContextProvider, GenerationParams, GenerationService, MockContextProvider, MockGeneration,
    MockVision, VisionService,
};
pub use session_log::SessionLog;
