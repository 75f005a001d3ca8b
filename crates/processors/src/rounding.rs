//! Numeric rounding: rewrites decimal numbers in model responses to a fixed
//! precision and flags the response as `rounded`.
//!
//! The configured precision can be overridden per request with the
//! `decimals` parameter, bounded by [`MAX_DECIMALS`].

use async_trait::async_trait;
use pipeline::{
    CapabilityDeclaration, Choice, Completion, InputEnvelope, InvocationContext, ItemKind,
    Message, ParameterSchema, ParameterType, Payload, Processor, ProcessorDescriptor,
    ProcessorFault,
};
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::{FactoryError, ProcessorIdentity};

const DECIMAL_PATTERN: &str = r"-?\d+\.\d+";

/// Tag flagged on every response this processor changes.
pub const ROUNDED_TAG: &str = "rounded";

/// Per-request parameter overriding the configured precision.
pub const DECIMALS_PARAMETER: &str = "decimals";

/// Largest precision accepted from configuration or a request.
pub const MAX_DECIMALS: usize = 12;

fn default_decimals() -> usize {
    1
}

/// Settings accepted under `[processors.settings]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NumericRoundingSettings {
    /// Digits kept after the decimal point.
    #[serde(default = "default_decimals")]
    pub decimals: usize,
}

impl Default for NumericRoundingSettings {
    fn default() -> Self {
        Self {
            decimals: default_decimals(),
        }
    }
}

#[derive(Debug)]
pub struct NumericRounding {
    descriptor: ProcessorDescriptor,
    decimals: usize,
    pattern: Regex,
}

impl NumericRounding {
    pub fn new(
        identity: ProcessorIdentity,
        settings: NumericRoundingSettings,
    ) -> Result<Self, FactoryError> {
        let pattern = Regex::new(DECIMAL_PATTERN).map_err(|source| FactoryError::InvalidPattern {
            processor: identity.to_string(),
            source,
        })?;
        if settings.decimals > MAX_DECIMALS {
            return Err(FactoryError::InvalidSettings {
                processor: identity.to_string(),
                message: format!(
                    "decimals must be at most {MAX_DECIMALS}, got {}",
                    settings.decimals
                ),
            });
        }
        let capability = CapabilityDeclaration::declare([ItemKind::Response], [ItemKind::Response])?;
        let parameters = ParameterSchema::new().field(
            DECIMALS_PARAMETER,
            ParameterType::Integer {
                minimum: Some(0),
                maximum: Some(MAX_DECIMALS as i64),
            },
            "Digits kept after the decimal point for this request.",
        );
        Ok(Self {
            descriptor: identity
                .into_descriptor(capability)
                .with_description(format!(
                    "Rounds decimal numbers in responses to {} place(s).",
                    settings.decimals
                ))
                .with_parameters(parameters),
            decimals: settings.decimals,
            pattern,
        })
    }

    /// Rounds every decimal number in `text` to the configured precision.
    pub fn round_text(&self, text: &str) -> String {
        self.round_text_to(text, self.decimals)
    }

    fn round_text_to(&self, text: &str, decimals: usize) -> String {
        self.pattern
            .replace_all(text, |caps: &Captures<'_>| {
                let matched = &caps[0];
                match matched.parse::<f64>() {
                    Ok(value) => format!("{value:.prec$}", prec = decimals),
                    Err(_) => matched.to_string(),
                }
            })
            .into_owned()
    }

    /// Precision for this invocation: the request's `decimals` when given,
    /// the configured value otherwise.
    fn decimals_for(&self, ctx: &InvocationContext) -> Result<usize, ProcessorFault> {
        let Some(value) = ctx.parameters().get(DECIMALS_PARAMETER) else {
            return Ok(self.decimals);
        };
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n <= MAX_DECIMALS)
            .ok_or_else(|| {
                format!("'{DECIMALS_PARAMETER}' must be an integer from 0 to {MAX_DECIMALS}, got {value}")
                    .into()
            })
    }
}

#[async_trait]
impl Processor for NumericRounding {
    fn descriptor(&self) -> &ProcessorDescriptor {
        &self.descriptor
    }

    async fn process(
        &self,
        envelope: &InputEnvelope,
        ctx: &mut InvocationContext,
    ) -> Result<(), ProcessorFault> {
        let Payload::Response(completion) = envelope.payload() else {
            return Ok(());
        };
        let decimals = self.decimals_for(ctx)?;

        let rounded = Completion::new(
            completion
                .choices
                .iter()
                .map(|choice| Choice {
                    message: Message {
                        content: self.round_text_to(&choice.message.content, decimals),
                        role: choice.message.role,
                    },
                })
                .collect(),
        );

        if &rounded != completion {
            ctx.flag(ROUNDED_TAG)?;
            ctx.modify(rounded);
        }
        Ok(())
    }
}
