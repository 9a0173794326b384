pub mod douban;
mod http;
pub mod llm;
pub mod score;
pub mod tmdb;
pub mod wikipedia;

pub use douban::DoubanProvider;
pub use llm::OpenAiKeywordGenerator;
pub use tmdb::TmdbProvider;
pub use wikipedia::WikipediaProvider;
