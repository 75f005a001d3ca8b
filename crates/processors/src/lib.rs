//! Reference processors and the factory that builds them from configuration.
//!
//! ## Architectural Layer
//!
//! **Plugins.** Each processor implements [`pipeline::Processor`] and holds
//! only state created at construction (compiled patterns, keyword tables), so
//! one instance serves concurrent requests without locking.
//!
//! | Processor | Consumes | Produces | Behaviour |
//! |-----------|----------|----------|-----------|
//! | [`PromptInjectionPolicy`] | prompt | none | rejects injection phrases |
//! | [`NumericRounding`] | response | response | rounds decimals, flags `rounded` |
//! | [`KeywordTagger`] | prompt, response | none | tags `topics_detected` |

pub mod factory;
pub mod policy;
pub mod rounding;
pub mod tagger;

pub use factory::{build_processor, FactoryError, ProcessorIdentity, ProcessorKind, ProcessorSpec};
pub use policy::{
    PromptInjectionPolicy, PromptInjectionSettings, DEFAULT_INJECTION_PATTERN,
    INJECTION_REJECT_REASON,
};
pub use rounding::{NumericRounding, NumericRoundingSettings, ROUNDED_TAG};
pub use tagger::{KeywordTagger, KeywordTaggerSettings, TOPICS_TAG};
