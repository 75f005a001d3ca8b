//! Keyword tagger: annotates prompts and responses with the topics whose
//! keywords appear in the text.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pipeline::{
    CapabilityDeclaration, InputEnvelope, InvocationContext, ItemKind, Payload, Processor,
    ProcessorDescriptor, ProcessorFault,
};
use serde::Deserialize;

use crate::{FactoryError, ProcessorIdentity};

/// Tag key under which detected topics are recorded.
pub const TOPICS_TAG: &str = "topics_detected";

/// Settings accepted under `[processors.settings]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeywordTaggerSettings {
    /// Topic name to the keywords that indicate it.
    #[serde(default)]
    pub topics: BTreeMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct KeywordTagger {
    descriptor: ProcessorDescriptor,
    topics: BTreeMap<String, Vec<String>>,
}

impl KeywordTagger {
    pub fn new(
        identity: ProcessorIdentity,
        settings: KeywordTaggerSettings,
    ) -> Result<Self, FactoryError> {
        if let Some((topic, _)) = settings
            .topics
            .iter()
            .find(|(topic, keywords)| {
                topic.trim().is_empty()
                    || keywords.is_empty()
                    || keywords.iter().any(|k| k.trim().is_empty())
            })
        {
            return Err(FactoryError::InvalidSettings {
                processor: identity.to_string(),
                message: format!("topic '{topic}' needs a non-empty name and non-empty keywords"),
            });
        }

        let topics: BTreeMap<String, Vec<String>> = settings
            .topics
            .into_iter()
            .map(|(topic, keywords)| {
                (
                    topic,
                    keywords.into_iter().map(|k| k.to_lowercase()).collect(),
                )
            })
            .collect();
        let capability =
            CapabilityDeclaration::declare([ItemKind::Prompt, ItemKind::Response], [])?;
        Ok(Self {
            descriptor: identity
                .into_descriptor(capability)
                .with_description("Tags traffic with the topics its keywords indicate."),
            topics,
        })
    }

    /// Returns the topics whose keywords occur in `text`, in sorted order.
    pub fn detect(&self, text: &str) -> Vec<&str> {
        let haystack = text.to_lowercase();
        self.topics
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k.as_str())))
            .map(|(topic, _)| topic.as_str())
            .collect()
    }
}

#[async_trait]
impl Processor for KeywordTagger {
    fn descriptor(&self) -> &ProcessorDescriptor {
        &self.descriptor
    }

    async fn process(
        &self,
        envelope: &InputEnvelope,
        ctx: &mut InvocationContext,
    ) -> Result<(), ProcessorFault> {
        let text = match envelope.payload() {
            Payload::Prompt(prompt) => prompt.concatenate(&[]),
            Payload::Response(completion) => completion
                .choices
                .iter()
                .map(|c| c.message.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => return Ok(()),
        };

        let topics = self.detect(&text);
        if !topics.is_empty() {
            ctx.add_tag(TOPICS_TAG, topics)?;
        }
        Ok(())
    }
}
