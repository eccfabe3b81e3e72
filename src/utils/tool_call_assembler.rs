use serde_json::Value;

use crate::types::ToolCall;

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Collects streamed tool-call fragments (start + argument pieces) into whole
/// [`ToolCall`]s. Arguments that are not valid JSON are kept as a raw string.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    pending: Vec<PendingCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started(&mut self, id: impl Into<String>, name: impl Into<String>) {
        let id = id.into();
        if self.pending.iter().any(|c| c.id == id) {
            return;
        }
        self.pending.push(PendingCall {
            id,
            name: name.into(),
            arguments: String::new(),
        });
    }

    /// Append an argument fragment. Fragments for unknown ids are dropped.
    pub fn on_partial(&mut self, id: &str, fragment: &str) {
        if let Some(call) = self.pending.iter_mut().find(|c| c.id == id) {
            call.arguments.push_str(fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finalize(self) -> Vec<ToolCall> {
        self.pending
            .into_iter()
            .map(|c| {
                let raw = c.arguments.trim();
                let arguments = if raw.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(c.arguments.clone()))
                };
                ToolCall {
                    id: c.id,
                    name: c.name,
                    arguments,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fragments_are_joined_per_call() {
        let mut a = ToolCallAssembler::new();
        a.on_started("c1", "lookup");
        a.on_started("c2", "vision");
        a.on_partial("c1", "{\"q\":");
        a.on_partial("c2", "{}");
        a.on_partial("c1", "\"rust\"}");
        a.on_partial("missing", "x");
        let calls = a.finalize();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({"q": "rust"}));
        assert_eq!(calls[1].name, "vision");
    }

    #[test]
    fn test_empty_and_invalid_arguments() {
        let mut a = ToolCallAssembler::new();
        a.on_started("c1", "noargs");
        a.on_started("c2", "broken");
        a.on_partial("c2", "{\"q\":");
        let calls = a.finalize();
        assert_eq!(calls[0].arguments, json!({}));
        assert_eq!(calls[1].arguments, json!("{\"q\":"));
    }
}
