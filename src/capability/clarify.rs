use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::capability::{Capability, string_arg};
use crate::error::SchemaError;

pub const ASK_USER: &str = "ask_user";

const NO_DETAILS: &str =
    "The user has no further details. Proceed with the request as originally stated.";
const BUDGET_SPENT: &str =
    "The user will not answer more questions for this request. Proceed with what you know.";

/// Lets the agent ask the user one clarifying question at a time.
///
/// Answers come from the active task's clarification text. The number of
/// questions per task is capped; the counter is cleared on every reset.
pub fn ask_user(max_questions: usize) -> Result<Capability, SchemaError> {
    let asked = Arc::new(AtomicUsize::new(0));
    let reset_counter = asked.clone();

    Ok(Capability::new(
        ASK_USER,
        "Ask the user one clarifying question about their request (date ranges, code sets, \
         which measurement, ...). Use it only when the request is genuinely ambiguous.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "question": {"type": "string"}
        },
        "required": ["question"],
        "additionalProperties": false
    }))?
    .with_handler(move |args, ctx| {
        let asked = asked.clone();
        async move {
            let question = string_arg(ASK_USER, &args, "question")?;
            if question.trim().is_empty() {
                return Ok("Please phrase a question for the user.".to_string());
            }
            if asked.fetch_add(1, Ordering::SeqCst) >= max_questions {
                return Ok(BUDGET_SPENT.to_string());
            }

            Ok(ctx
                .task
                .clarification
                .clone()
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| NO_DETAILS.to_string()))
        }
    })
    .with_reset_hook(move || reset_counter.store(0, Ordering::SeqCst)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::capability::InvocationContext;
    use crate::env::Task;

    fn ctx(clarification: Option<&str>) -> InvocationContext {
        let mut task = Task::new("Average hemoglobin of recent patients?");
        task.clarification = clarification.map(str::to_string);
        InvocationContext {
            task_index: 0,
            task: Arc::new(task),
        }
    }

    #[tokio::test]
    async fn answers_from_task_until_budget_spent_then_resets() {
        let capability = ask_user(1).expect("schema valid");
        let ask = json!({"question": "Which time window?"});

        let first = capability
            .invoke(ask.clone(), ctx(Some("Only admissions during 2150.")))
            .await
            .expect("answers");
        assert_eq!(first, "Only admissions during 2150.");

        let second = capability
            .invoke(ask.clone(), ctx(Some("Only admissions during 2150.")))
            .await
            .expect("answers");
        assert_eq!(second, BUDGET_SPENT);

        capability.reset();

        let after_reset = capability.invoke(ask, ctx(None)).await.expect("answers");
        assert_eq!(after_reset, NO_DETAILS);
    }
}
