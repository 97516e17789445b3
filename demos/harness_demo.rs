//! End-to-end walkthrough of the harness against a scripted stub client,
//! so it runs without any API key.
//!
//! Run with: `cargo run --example harness_demo`

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use promptloom::lm_client::{CompletionConfig, LmClient, LmMessage};
use promptloom::{Harness, HarnessConfig, HarnessError, MessageType};

struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedClient {
    fn new() -> Self {
        ScriptedClient {
            replies: Mutex::new(VecDeque::new()),
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let client = Arc::new(ScriptedClient::new());
    let harness = Harness::new(client.clone(), HarnessConfig::default())?;

    // 1. A data message stores a tiding.
    client.push("let unit_price = 12.5;\nlet __vars = #{unit_price: 12.5};");
    harness
        .process_message(0, "the unit price is 12.50 euros", MessageType::Data)
        .await?;
    println!("tidings after data message: {}", harness.context_snapshot());

    // 2. A code message synthesizes a function and invokes it on the tiding.
    client.push(
        "```rhai\n/// Multiplies the unit price by a quantity.\nfn total_price(unit_price, quantity) {\n    unit_price * quantity\n}\n```",
    );
    client.push("let __output = total_price(unit_price, 4);");
    client.push("total # the total price for the requested quantity");
    let total = harness
        .process_message(1, "compute the price of 4 units", MessageType::Code)
        .await?;
    println!("total for 4 units: {:?}", total);

    // 3. A streaming routine reports progress and commits a tiding on final.
    client.push(
        "```rhai\n/// Checks the order in two steps, then stores the verdict.\nfn check_order() {\n    [\n        #{ type: \"step\", description: \"validating quantities\" },\n        #{ type: \"step\", description: \"validating prices\" },\n        #{ type: \"final\", modified_vars: #{ order_ok: true } }\n    ]\n}\n```",
    );
    client.push("let __generator = check_order();");
    client.push("order_ok # whether the order passed validation");
    let mut stream = harness
        .process_message_streaming(2, "check the order and keep me posted", MessageType::GeneratingRoutine)
        .await?;
    while let Some(notification) = stream.next().await {
        let notification = notification?;
        println!("[{}] {}", notification.kind, notification.description);
    }
    println!(
        "order_ok tiding: {:?}",
        harness.tiding("order_ok").map(|t| t.content.as_bool())
    );

    Ok(())
}
