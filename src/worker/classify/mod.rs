//! Topical relevance classification for incoming posts.

pub mod classifier;
pub mod keywords;

pub use classifier::RelevanceClassifier;
pub use keywords::MENTAL_HEALTH_KEYWORDS;
