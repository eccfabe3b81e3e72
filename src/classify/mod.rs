//! Prompt classification: one short, non-streamed call that labels a chat
//! request before routing.

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::drivers::LanguageModel;
use crate::types::{GenerationRequest, Message};

/// Closed set of request labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationLabel {
    /// The user shares or asks about an image.
    Vision,
    /// A factual or how-to question.
    Question,
    #[default]
    Other,
}

impl ClassificationLabel {
    pub const ALL: [ClassificationLabel; 3] = [
        ClassificationLabel::Vision,
        ClassificationLabel::Question,
        ClassificationLabel::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationLabel::Vision => "vision",
            ClassificationLabel::Question => "question",
            ClassificationLabel::Other => "other",
        }
    }
}

/// A flat string enum listing [`ClassificationLabel::ALL`].
impl JsonSchema for ClassificationLabel {
    fn schema_name() -> String {
        "ClassificationLabel".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            enum_values: Some(Self::ALL.iter().map(|l| Value::from(l.as_str())).collect()),
            ..Default::default()
        }
        .into()
    }
}

impl std::fmt::Display for ClassificationLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClassificationLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClassificationLabel::ALL
            .iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| format!("unknown classification label: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub model: String,
    pub instructions: String,
    pub max_tokens: u32,
    /// How many trailing conversation messages the classifier sees.
    pub context_messages: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            instructions: "Classify the user's latest request. Answer with exactly one label: \
                           \"vision\" if the user shares or asks about an image, \
                           \"question\" for a factual or how-to question, \
                           \"other\" for anything else."
                .to_string(),
            max_tokens: 16,
            context_messages: 4,
        }
    }
}

/// JSON schema of the classifier output: `{"label": <ClassificationLabel>}`.
pub fn label_schema() -> Value {
    let mut label = serde_json::to_value(schemars::schema_for!(ClassificationLabel)).unwrap_or_else(|_| json!({}));
    if let Some(obj) = label.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    json!({
        "type": "object",
        "properties": { "label": label },
        "required": ["label"],
        "additionalProperties": false,
    })
}

/// Read a label out of model output: `{"label": "x"}`, `"x"` or `x`.
pub fn parse_label(output: &str) -> Option<ClassificationLabel> {
    let trimmed = output.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        let text = match &v {
            Value::Object(map) => map.get("label").and_then(|l| l.as_str()),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        };
        return text.and_then(|t| t.parse().ok());
    }
    trimmed
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c.is_whitespace())
        .parse()
        .ok()
}

/// Labels a conversation with one constrained `generate` call. Never fails:
/// provider errors and out-of-enum answers fall back to
/// [`ClassificationLabel::Other`].
pub struct PromptClassifier {
    model: Arc<dyn LanguageModel>,
    config: ClassifierConfig,
}

impl PromptClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, config: ClassifierConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn build_request(&self, messages: &[Message]) -> GenerationRequest {
        let start = messages.len().saturating_sub(self.config.context_messages.max(1));
        GenerationRequest::new(self.config.model.clone(), messages[start..].to_vec())
            .system(self.config.instructions.clone())
            .temperature(0.0)
            .max_tokens(self.config.max_tokens)
            .response_schema(label_schema())
    }

    pub async fn classify(&self, messages: &[Message]) -> ClassificationLabel {
        let request = self.build_request(messages);
        match self.model.generate(&request).await {
            Ok(result) => match parse_label(&result.text) {
                Some(label) => {
                    debug!(label = %label, "request classified");
                    label
                }
                None => {
                    warn!(output = %result.text, "classifier answered outside the label set, using fallback");
                    ClassificationLabel::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "classification failed, using fallback");
                ClassificationLabel::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ScriptedModel;
    use crate::types::{ContentBlock, MessageContent, MessageRole};

    #[test]
    fn test_parse_label_variants() {
        assert_eq!(parse_label(r#"{"label":"vision"}"#), Some(ClassificationLabel::Vision));
        assert_eq!(parse_label("\"Question\""), Some(ClassificationLabel::Question));
        assert_eq!(parse_label(" other.\n"), Some(ClassificationLabel::Other));
        assert_eq!(parse_label("weather"), None);
        assert_eq!(parse_label(r#"{"label":"weather"}"#), None);
    }

    #[test]
    fn test_label_schema_enumerates_labels() {
        let schema = label_schema();
        let label = &schema["properties"]["label"];
        let expected: Vec<Value> = ClassificationLabel::ALL.iter().map(|l| json!(l.as_str())).collect();
        assert_eq!(label["enum"].as_array().unwrap(), &expected);
        assert_eq!(label["type"], "string");
        assert!(label.get("oneOf").is_none());
        assert!(label.get("title").is_none());
        assert_eq!(schema["required"][0], "label");
        assert_eq!(ClassificationLabel::default(), ClassificationLabel::Other);
    }

    #[test]
    fn test_request_is_small_and_deterministic() {
        let c = PromptClassifier::new(Arc::new(ScriptedModel::new()), ClassifierConfig::default());
        let msgs: Vec<Message> = (0..10).map(|i| Message::user(format!("m{}", i))).collect();
        let req = c.build_request(&msgs);
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages[0].text(), "m6");
        assert_eq!(req.temperature, Some(0.0));
        assert!(req.response_schema.is_some());
    }

    #[tokio::test]
    async fn test_classify_with_model() {
        let c = PromptClassifier::new(Arc::new(ScriptedModel::new()), ClassifierConfig::default());
        let image = Message::with_content(
            MessageRole::User,
            MessageContent::blocks(vec![
                ContentBlock::text("what is this"),
                ContentBlock::image_url("https://x/cat.png", Some("image/png".into())),
            ]),
        );
        assert_eq!(c.classify(&[image]).await, ClassificationLabel::Vision);
        assert_eq!(c.classify(&[Message::user("how do lifetimes work?")]).await, ClassificationLabel::Question);
        assert_eq!(c.classify(&[Message::user("thanks")]).await, ClassificationLabel::Other);
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_other() {
        let failing = PromptClassifier::new(Arc::new(ScriptedModel::new().failing("down")), ClassifierConfig::default());
        assert_eq!(failing.classify(&[Message::user("hi?")]).await, ClassificationLabel::Other);
    }
}
