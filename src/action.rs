//! Decoding of raw assistant turns into environment actions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{ModelCompletion, ModelToolCall};

/// A capability call proposed by the model. Arguments are passed through
/// unvalidated; the capability itself rejects bad input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub call_id: String,
    pub capability: String,
    pub arguments: Value,
}

impl Invocation {
    pub fn to_tool_call(&self) -> ModelToolCall {
        ModelToolCall {
            id: self.call_id.clone(),
            name: self.capability.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Invoke(Invocation),
    /// Speak to the user. Terminal for the episode.
    Respond { text: String },
}

impl Action {
    pub fn is_respond(&self) -> bool {
        matches!(self, Self::Respond { .. })
    }
}

/// Maps one assistant turn to exactly one action.
///
/// Only the first proposed call is considered. A first call without a name
/// falls back to responding with the turn's text, so decoding never fails.
pub fn decode_action(completion: &ModelCompletion) -> Action {
    match completion.tool_calls.first() {
        Some(call) if !call.name.trim().is_empty() => Action::Invoke(Invocation {
            call_id: call.id.clone(),
            capability: call.name.clone(),
            arguments: call.arguments.clone(),
        }),
        _ => Action::Respond {
            text: completion.text.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(id: &str, name: &str, arguments: Value) -> ModelToolCall {
        ModelToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn first_of_many_calls_wins() {
        let completion = ModelCompletion {
            text: Some("let me look".to_string()),
            tool_calls: vec![
                call("a", "list_tables", json!({})),
                call("b", "table_schema", json!({"table": "patients"})),
                call("c", "run_query", json!({"sql": "SELECT 1"})),
            ],
            ..ModelCompletion::default()
        };

        assert_eq!(
            decode_action(&completion),
            Action::Invoke(Invocation {
                call_id: "a".to_string(),
                capability: "list_tables".to_string(),
                arguments: json!({}),
            })
        );
    }

    #[test]
    fn no_calls_decode_to_respond() {
        let completion = ModelCompletion {
            text: Some("SQL_QUERY: SELECT COUNT(*) FROM patients".to_string()),
            ..ModelCompletion::default()
        };

        let action = decode_action(&completion);
        assert!(action.is_respond());
        assert_eq!(
            action,
            Action::Respond {
                text: "SQL_QUERY: SELECT COUNT(*) FROM patients".to_string()
            }
        );
    }

    #[test]
    fn nameless_call_falls_back_to_turn_text() {
        let completion = ModelCompletion {
            text: Some("which admission table?".to_string()),
            tool_calls: vec![call("a", "  ", json!({"sql": "SELECT 1"}))],
            ..ModelCompletion::default()
        };

        assert_eq!(
            decode_action(&completion),
            Action::Respond {
                text: "which admission table?".to_string()
            }
        );
    }

    #[test]
    fn empty_turn_responds_with_empty_text() {
        assert_eq!(
            decode_action(&ModelCompletion::default()),
            Action::Respond {
                text: String::new()
            }
        );
    }

    #[test]
    fn malformed_arguments_are_not_validated() {
        let completion = ModelCompletion {
            tool_calls: vec![call("a", "run_query", json!("{not json"))],
            ..ModelCompletion::default()
        };

        let Action::Invoke(invocation) = decode_action(&completion) else {
            panic!("expected invoke");
        };
        assert_eq!(invocation.arguments, json!("{not json"));
    }
}
