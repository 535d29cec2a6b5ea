//! Model access, code extraction, retrieval and web research.

pub mod extract;
pub mod llm;
pub mod research;
pub mod retrieval;

pub use extract::{extract_code, json_object_slice};
pub use llm::{
    GenerateRequest, LlmClient, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole,
    MockProvider, OllamaProvider,
};
pub use research::{DuckDuckGo, MockSearch, SearchResult, WebSearch};
pub use retrieval::{DocType, Embedder, LanguageIndex, OllamaEmbedder, RetrievalError, RetrievalIndex};
