pub mod ai;
pub mod engine;
pub mod learning;
pub mod limiter;
pub mod rules;
pub mod text;
pub mod transfer;

pub use ai::{AiConfig, AiError, AiVerdict, Classifier, GeminiClassifier};
pub use engine::{Cancelled, CategorizationEngine, CategorizeStats, Decision, Stage};
pub use learning::{LearningConfig, LearningLoop};
pub use limiter::AiRateLimiter;
pub use rules::{CategorizationRule, RuleBook, RuleConditions, RuleError, RuleOrigin};
pub use transfer::{TransferConfig, TransferDetector};
