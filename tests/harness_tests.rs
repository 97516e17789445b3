use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use promptloom::lm_client::{CompletionConfig, LmClient, LmMessage};
use promptloom::{Harness, HarnessConfig, HarnessError, MessageType};

// Stub client replaying a fixed sequence of replies, one per LM call.
struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedClient {
    fn new(replies: &[&str]) -> Self {
        ScriptedClient {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        }
    }

    fn push(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(reply.to_string());
    }
}

#[async_trait]
impl LmClient for ScriptedClient {
    async fn run(
        &self,
        _pre_prompt: Option<&str>,
        _prompt: &str,
        _config: &CompletionConfig,
    ) -> Result<String, HarnessError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| HarnessError::LmUnavailable("scripted replies exhausted".to_string()))
    }

    async fn run_messages(
        &self,
        messages: &[LmMessage],
        config: &CompletionConfig,
    ) -> Result<Vec<LmMessage>, HarnessError> {
        let reply = self.run(None, "", config).await?;
        let mut result = messages.to_vec();
        result.push(LmMessage::assistant(reply));
        Ok(result)
    }
}

fn scripted_harness(replies: &[&str]) -> (Arc<ScriptedClient>, Harness) {
    let client = Arc::new(ScriptedClient::new(replies));
    let harness = Harness::new(client.clone(), HarnessConfig::default()).unwrap();
    (client, harness)
}

const DATA_X_7: &str = "let x = 7;\nlet __vars = #{x: 7};";

const DOUBLER_FN: &str = "```rhai\n/// Doubles the given number.\nfn doubler(n) {\n    n * 2\n}\n```";

async fn submit_data_x_7(client: &ScriptedClient, harness: &Harness, mid: u64) {
    client.push(DATA_X_7);
    harness
        .process_message(mid, "x = 7", MessageType::Data)
        .await
        .unwrap();
}

// Scenario: data then code. The data message stores x = 7, the code message
// synthesizes doubler and invokes it on x.
#[tokio::test]
async fn test_data_then_code() {
    let (client, harness) = scripted_harness(&[]);

    submit_data_x_7(&client, &harness, 0).await;
    assert_eq!(harness.last_mid(), 0);
    let x = harness.tiding("x").expect("tiding x should exist");
    assert_eq!(x.content.as_int().unwrap(), 7);

    client.push(DOUBLER_FN);
    client.push("let __output = doubler(x);");
    client.push("");
    let output = harness
        .process_message(1, "write a function that doubles x", MessageType::Code)
        .await
        .unwrap();

    assert_eq!(output, Some(serde_json::json!(14)));
    assert_eq!(harness.last_mid(), 1);
    assert!(harness.skill("doubler").is_some());
    assert!(harness.has_namespace_fn("doubler"));
    // The data tiding is untouched by the code message.
    assert_eq!(harness.tiding("x").unwrap().content.as_int().unwrap(), 7);
}

// The stored docstring of a synthesized skill ends with a sentence naming
// the originating message id.
#[tokio::test]
async fn test_docstring_addendum() {
    let (client, harness) = scripted_harness(&[]);

    client.push(DOUBLER_FN);
    client.push("let __output = doubler(3);");
    client.push("");
    harness
        .process_message(7, "double three", MessageType::Code)
        .await
        .unwrap();

    let skill = harness.skill("doubler").unwrap();
    assert!(skill.docstring.ends_with("message id 7."));
    assert!(skill.code.contains("message id 7."));
    assert!(skill.docstring.starts_with("Doubles the given number."));
}

// Empty synthesis: the LM returned a fenced comment. No skill, no
// invocation, no tiding — but last_mid still advances.
#[tokio::test]
async fn test_empty_synthesis_advances_mid() {
    let (client, harness) = scripted_harness(&[]);

    client.push("```\n// nothing\n```");
    let output = harness
        .process_message(3, "do something impossible", MessageType::Code)
        .await
        .unwrap();

    assert_eq!(output, None);
    assert_eq!(harness.last_mid(), 3);
    assert_eq!(harness.skill_names(), vec!["language_model".to_string()]);
    assert!(harness.tiding("x").is_none());
}

// Classification of an auto message into code_skill: skills installed, no
// invocation produced.
#[tokio::test]
async fn test_auto_classifies_code_skill() {
    let (client, harness) = scripted_harness(&[]);

    client.push("code_skill");
    client.push(
        "```rhai\n/// Lower-cases the given text.\nfn lowercase_text(s) {\n    s.to_lower()\n}\n```",
    );
    let output = harness
        .process_message(
            4,
            "please define a helper that lower-cases a string",
            MessageType::Auto,
        )
        .await
        .unwrap();

    assert_eq!(output, None);
    assert!(harness.skill("lowercase_text").is_some());
    assert!(harness.has_namespace_fn("lowercase_text"));
    assert_eq!(harness.last_mid(), 4);
}

// Invocation error: the snippet references a variable that does not exist.
// The freshly installed skill survives; no tiding is committed.
#[tokio::test]
async fn test_invocation_error_keeps_skill() {
    let (client, harness) = scripted_harness(&[]);

    client.push(DOUBLER_FN);
    client.push("let __output = doubler(missing_var);");
    client.push("");
    let result = harness
        .process_message(5, "double the missing value", MessageType::Routine)
        .await;

    assert!(matches!(result, Err(HarnessError::Invocation(_))));
    assert!(harness.skill("doubler").is_some());
    assert!(harness.has_namespace_fn("doubler"));
    assert!(harness.tiding("x").is_none());
    assert_eq!(harness.last_mid(), -1);
}

// Session reset drops skills, tidings and namespace contents back to the
// bootstrap state.
#[tokio::test]
async fn test_session_reset() {
    let (client, harness) = scripted_harness(&[]);

    submit_data_x_7(&client, &harness, 0).await;
    client.push(DOUBLER_FN);
    client.push("let __output = doubler(x);");
    client.push("");
    harness
        .process_message(1, "write a function that doubles x", MessageType::Code)
        .await
        .unwrap();

    harness.reset();

    assert!(harness.tiding("x").is_none());
    assert!(harness.skill("doubler").is_none());
    assert!(!harness.has_namespace_fn("doubler"));
    assert!(harness.skill("language_model").is_some());
    assert_eq!(harness.last_mid(), -1);
}

// last_mid is non-decreasing across successful messages.
#[tokio::test]
async fn test_monotonic_history() {
    let (client, harness) = scripted_harness(&[]);

    let mut previous = harness.last_mid();
    for mid in 0..3u64 {
        client.push("let value = 1;\nlet __vars = #{value: 1};");
        harness
            .process_message(mid, "the value is one", MessageType::Data)
            .await
            .unwrap();
        assert!(harness.last_mid() >= previous);
        previous = harness.last_mid();
    }
}

// Tiding replacement: a second data message assigning the same identifier
// replaces the value.
#[tokio::test]
async fn test_tiding_replacement() {
    let (client, harness) = scripted_harness(&[]);

    submit_data_x_7(&client, &harness, 0).await;
    client.push("let x = 8;\nlet __vars = #{x: 8};");
    harness
        .process_message(1, "x = 8", MessageType::Data)
        .await
        .unwrap();

    let x = harness.tiding("x").unwrap();
    assert_eq!(x.content.as_int().unwrap(), 8);
    assert_eq!(x.description, "");
}

// Reinstalling a byte-identical skill is a no-op on the store and the
// namespace.
#[tokio::test]
async fn test_idempotent_install() {
    let (client, harness) = scripted_harness(&[]);

    for _ in 0..2 {
        client.push(DOUBLER_FN);
        client.push("let __output = doubler(3);");
        client.push("");
        let output = harness
            .process_message(1, "double three", MessageType::Code)
            .await
            .unwrap();
        assert_eq!(output, Some(serde_json::json!(6)));
    }

    let names = harness.skill_names();
    assert_eq!(names.iter().filter(|n| n.as_str() == "doubler").count(), 1);
}

// Empty messages are rejected before any session mutation.
#[tokio::test]
async fn test_empty_message_rejected() {
    let (_client, harness) = scripted_harness(&[]);

    let result = harness.process_message(0, "   \n", MessageType::Data).await;
    assert!(matches!(result, Err(HarnessError::EmptyMessage)));
    assert_eq!(harness.last_mid(), -1);
}

// Reserved message types surface NotImplemented without touching state.
#[tokio::test]
async fn test_reserved_types_not_implemented() {
    let (_client, harness) = scripted_harness(&[]);

    for message_type in [
        MessageType::RoutineSkill,
        MessageType::Query,
        MessageType::QuerySkill,
    ]
    .iter()
    {
        let result = harness
            .process_message(0, "do something reserved", *message_type)
            .await;
        assert!(matches!(result, Err(HarnessError::NotImplemented(_))));
    }
    assert_eq!(harness.last_mid(), -1);
}

// generating_routine cannot be processed through the terminal flow.
#[tokio::test]
async fn test_generating_routine_rejected_in_terminal_flow() {
    let (_client, harness) = scripted_harness(&[]);

    let result = harness
        .process_message(0, "stream me something", MessageType::GeneratingRoutine)
        .await;
    assert!(matches!(result, Err(HarnessError::InvalidType(_))));
}

// Adversarial classifier output is rejected as ClassificationFailed.
#[tokio::test]
async fn test_classification_closure() {
    let (client, harness) = scripted_harness(&[]);

    client.push("bananas are a kind of fruit");
    let result = harness
        .process_message(0, "hello there", MessageType::Auto)
        .await;
    assert!(matches!(result, Err(HarnessError::ClassificationFailed(_))));
    assert_eq!(harness.last_mid(), -1);
}

// Synthesized code can call back into the LM through the bootstrap
// language_model function.
#[tokio::test]
async fn test_language_model_callback() {
    let (client, harness) = scripted_harness(&[]);

    client.push("```rhai\n/// Asks the language model to greet someone.\nfn greeter(name) {\n    language_model(\"Greet \" + name)\n}\n```");
    client.push("let __output = greeter(\"Ada\");");
    client.push("");
    // Consumed at execution time by the bootstrap language_model callable.
    client.push("Hello, Ada!");

    let output = harness
        .process_message(0, "write a function that greets people", MessageType::Code)
        .await
        .unwrap();
    assert_eq!(output, Some(serde_json::json!("Hello, Ada!")));
}

// An LM transport failure propagates as LmUnavailable; the harness does not
// retry.
#[tokio::test]
async fn test_lm_unavailable_propagates() {
    let (_client, harness) = scripted_harness(&[]);

    let result = harness
        .process_message(0, "anything at all", MessageType::Code)
        .await;
    assert!(matches!(result, Err(HarnessError::LmUnavailable(_))));
}

// The context snapshot reports mid, tidings and plain globals.
#[tokio::test]
async fn test_context_snapshot() {
    let (client, harness) = scripted_harness(&[]);

    submit_data_x_7(&client, &harness, 0).await;
    let snapshot = harness.context_snapshot();

    assert_eq!(snapshot["mid"], serde_json::json!(0));
    assert_eq!(snapshot["tidings"]["x"]["content"], serde_json::json!(7));
    assert_eq!(snapshot["tidings"]["x"]["type"], serde_json::json!("i64"));
}
