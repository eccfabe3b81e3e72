//! Label-based routing.
//!
//! This module is **pure logic**: it maps a [`ClassificationLabel`] to the
//! tool set, tool-choice policy and streaming mode of the primary
//! generation. It performs no I/O and knows nothing about providers.

use serde::{Deserialize, Serialize};

use crate::classify::ClassificationLabel;
use crate::types::ToolChoice;
use crate::{Error, ErrorContext, Result};

/// How the primary generation is requested from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    #[default]
    Stream,
    /// Single-shot call; the outbound stream is synthesised from the result.
    Generate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// The tool forced for `vision` requests.
    pub vision_tool: String,
    /// Tools offered with free choice for every other label.
    pub tools: Vec<String>,
    pub mode: StreamingMode,
    /// Labels served in [`StreamingMode::Generate`] regardless of `mode`.
    pub generate_labels: Vec<ClassificationLabel>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            vision_tool: "describe_image".to_string(),
            tools: vec!["get_current_time".to_string()],
            mode: StreamingMode::Stream,
            generate_labels: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vision_tool.trim().is_empty() {
            return Err(Error::configuration_with_context(
                "router needs a vision tool",
                ErrorContext::new().with_field_path("router.vision_tool"),
            ));
        }
        Ok(())
    }
}

/// Routing decision for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub label: ClassificationLabel,
    /// Names of the tools offered to the model, in offer order.
    pub tools: Vec<String>,
    pub tool_choice: ToolChoice,
    pub mode: StreamingMode,
}

impl Route {
    pub fn offers(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRouter {
    config: RouterConfig,
}

impl ToolRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn route(&self, label: ClassificationLabel) -> Route {
        let mode = if self.config.generate_labels.contains(&label) {
            StreamingMode::Generate
        } else {
            self.config.mode
        };
        match label {
            ClassificationLabel::Vision => Route {
                label,
                tools: vec![self.config.vision_tool.clone()],
                tool_choice: ToolChoice::tool(self.config.vision_tool.clone()),
                mode,
            },
            ClassificationLabel::Question | ClassificationLabel::Other => {
                let mut tools: Vec<String> = Vec::with_capacity(self.config.tools.len());
                for t in &self.config.tools {
                    if !tools.contains(t) {
                        tools.push(t.clone());
                    }
                }
                let tool_choice = if tools.is_empty() {
                    ToolChoice::None
                } else {
                    ToolChoice::Auto
                };
                Route {
                    label,
                    tools,
                    tool_choice,
                    mode,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_forces_single_tool() {
        let router = ToolRouter::default();
        let route = router.route(ClassificationLabel::Vision);
        assert_eq!(route.tools, vec!["describe_image".to_string()]);
        assert_eq!(route.tool_choice, ToolChoice::tool("describe_image"));
        assert!(!route.tool_choice.allows_free_choice());
    }

    #[test]
    fn test_other_labels_allow_free_choice() {
        let router = ToolRouter::new(RouterConfig {
            tools: vec!["a".into(), "b".into(), "a".into()],
            ..Default::default()
        });
        for label in [ClassificationLabel::Question, ClassificationLabel::Other] {
            let route = router.route(label);
            assert_eq!(route.tools, vec!["a".to_string(), "b".to_string()]);
            assert!(route.tool_choice.allows_free_choice());
            assert!(route.offers("b"));
            assert_eq!(route.mode, StreamingMode::Stream);
        }
    }

    #[test]
    fn test_no_tools_means_no_tool_choice() {
        let router = ToolRouter::new(RouterConfig {
            tools: Vec::new(),
            ..Default::default()
        });
        assert_eq!(router.route(ClassificationLabel::Other).tool_choice, ToolChoice::None);
    }

    #[test]
    fn test_generate_labels_override_mode() {
        let router = ToolRouter::new(RouterConfig {
            generate_labels: vec![ClassificationLabel::Question],
            ..Default::default()
        });
        assert_eq!(router.route(ClassificationLabel::Question).mode, StreamingMode::Generate);
        assert_eq!(router.route(ClassificationLabel::Other).mode, StreamingMode::Stream);
    }

    #[test]
    fn test_routing_is_pure() {
        let router = ToolRouter::default();
        assert_eq!(
            router.route(ClassificationLabel::Vision),
            router.route(ClassificationLabel::Vision)
        );
    }

    #[test]
    fn test_validate_rejects_blank_vision_tool() {
        let cfg = RouterConfig {
            vision_tool: " ".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Configuration { .. })));
    }
}
