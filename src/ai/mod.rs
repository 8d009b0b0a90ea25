/// AI 摘要模块
pub mod gemini;
pub mod pool;

pub use gemini::{GeminiClient, Summarizer};
pub use pool::{DEFAULT_WORKERS, SummaryReport, summarize_all};
