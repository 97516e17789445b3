use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use promptloom::lm_client::{CompletionConfig, LmClient, LmMessage, Role, TracedClient};
use promptloom::{HarnessError, Trace};

struct FixedClient {
    reply: String,
}

#[async_trait]
impl LmClient for FixedClient {
    async fn run(
        &self,
        _pre_prompt: Option<&str>,
        _prompt: &str,
        _config: &CompletionConfig,
    ) -> Result<String, HarnessError> {
        Ok(self.reply.clone())
    }

    async fn run_messages(
        &self,
        messages: &[LmMessage],
        _config: &CompletionConfig,
    ) -> Result<Vec<LmMessage>, HarnessError> {
        let mut result = messages.to_vec();
        result.push(LmMessage::assistant(self.reply.clone()));
        Ok(result)
    }
}

fn hooked_trace() -> (Trace, Arc<Mutex<Vec<String>>>) {
    let entries: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let trace = Trace::disabled();
    let sink = Arc::clone(&entries);
    trace.set_hook(Box::new(move |entry| {
        sink.lock().unwrap().push(entry.to_string());
    }));
    (trace, entries)
}

#[test]
fn test_ipython_role_is_rewritten_on_the_wire() {
    assert_eq!(Role::Ipython.as_str(), "ipython");
    assert_eq!(Role::Ipython.wire_name(), "function");
    assert_eq!(Role::Function.wire_name(), "function");
    assert_eq!(Role::User.wire_name(), "user");
}

#[test]
fn test_completion_config_merge() {
    let defaults = CompletionConfig::deterministic();
    let call = CompletionConfig {
        temperature: Some(0.7),
        max_tokens: Some(128),
        ..CompletionConfig::default()
    };

    let merged = call.merged_over(&defaults);
    assert_eq!(merged.temperature, Some(0.7));
    assert_eq!(merged.max_tokens, Some(128));
    // Unset fields fall back to the session defaults.
    assert_eq!(merged.seed, Some(42));
    assert_eq!(merged.top_p, Some(1.0));
    assert_eq!(merged.stream, Some(true));
}

#[test]
fn test_deterministic_defaults_have_stable_seed() {
    assert_eq!(CompletionConfig::deterministic().seed, Some(42));
}

// Every run emits a trace segment: separator, pre-prompt, prompt, response.
#[tokio::test]
async fn test_traced_client_run_segment() {
    let (trace, entries) = hooked_trace();
    let client = TracedClient::new(
        Arc::new(FixedClient {
            reply: "pong".to_string(),
        }),
        trace,
    );

    let reply = client
        .run(Some("be terse"), "ping", &CompletionConfig::default())
        .await
        .unwrap();
    assert_eq!(reply, "pong");

    let entries = entries.lock().unwrap();
    assert_eq!(entries[0], "#".repeat(80));
    assert_eq!(entries[1], "<<PRE-PROMPT>>");
    assert_eq!(entries[2], "be terse");
    assert_eq!(entries[3], "<<PROMPT>>");
    assert_eq!(entries[4], "ping");
    assert_eq!(entries[5], "<<RESPONSE>>");
    assert_eq!(entries[6], "pong");
}

// run_messages traces each input message under its role marker and the
// appended assistant reply last.
#[tokio::test]
async fn test_traced_client_run_messages_segment() {
    let (trace, entries) = hooked_trace();
    let client = TracedClient::new(
        Arc::new(FixedClient {
            reply: "sure".to_string(),
        }),
        trace,
    );

    let messages = vec![
        LmMessage::system("stay calm"),
        LmMessage {
            role: Role::Ipython,
            content: "tool output".to_string(),
        },
        LmMessage::user("continue"),
    ];
    let result = client
        .run_messages(&messages, &CompletionConfig::default())
        .await
        .unwrap();

    assert_eq!(result.len(), 4);
    assert_eq!(result[3].content, "sure");

    let entries = entries.lock().unwrap();
    assert_eq!(entries[0], "#".repeat(80));
    assert_eq!(entries[1], "<<system>>");
    // The trace shows the message's own role; the wire rewrite happens in
    // the transport layer.
    assert_eq!(entries[3], "<<ipython>>");
    assert_eq!(entries[5], "<<user>>");
    assert_eq!(entries[7], "<<assistant>>");
    assert_eq!(entries[8], "sure");
}

// Errors from the inner client pass through untouched.
#[tokio::test]
async fn test_traced_client_propagates_errors() {
    struct FailingClient;

    #[async_trait]
    impl LmClient for FailingClient {
        async fn run(
            &self,
            _pre_prompt: Option<&str>,
            _prompt: &str,
            _config: &CompletionConfig,
        ) -> Result<String, HarnessError> {
            Err(HarnessError::LmUnavailable("down".to_string()))
        }

        async fn run_messages(
            &self,
            _messages: &[LmMessage],
            _config: &CompletionConfig,
        ) -> Result<Vec<LmMessage>, HarnessError> {
            Err(HarnessError::LmUnavailable("down".to_string()))
        }
    }

    let (trace, _entries) = hooked_trace();
    let client = TracedClient::new(Arc::new(FailingClient), trace);
    let result = client.run(None, "x", &CompletionConfig::default()).await;
    assert!(matches!(result, Err(HarnessError::LmUnavailable(_))));
}
