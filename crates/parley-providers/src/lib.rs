//! HTTP adapters for Parley's external capabilities.
//!
//! Each adapter owns the provider's wire format and normalizes responses
//! into the typed contract of the trait it implements.

pub mod lookup;
pub mod openai;

pub use lookup::HttpContextProvider;
pub use openai::OpenAiCompatibleClient;
