//! The compile-execute loop at the centre of the crate.
//!
//! A [`Harness`] owns one session: its skill store, tiding store, execution
//! namespace, and the pair of trace streams. Each inbound user message is
//! classified (when submitted as `auto`), routed through the synthesis
//! pipeline of its message type — one to three errands against the LM —
//! parsed into skills, installed into the namespace, and finally invoked.
//! The invocation's `__output` becomes the terminal return value; its
//! `__vars` become tidings available to every later message.
//!
//! Two entry points exist:
//!
//! - [`Harness::process_message`] for terminal messages, returning a single
//!   value, and
//! - [`Harness::process_message_streaming`] for `generating_routine`
//!   messages, returning a lazy [`NotificationStream`] of progress
//!   notifications. The distinguished `final` element of the routine's
//!   sequence is consumed internally to commit tidings and is never
//!   forwarded.
//!
//! Failure at any stage is fatal to that message only: whatever was already
//! committed (installed skills included) stays, and the session remains
//! usable. The namespace models a growing program; there is no rollback.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use promptloom::clients::openai::OpenAiCompatClient;
//! use promptloom::{Harness, HarnessConfig, MessageType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = Arc::new(OpenAiCompatClient::new(&key, "gpt-4.1-mini"));
//!     let harness = Harness::new(client, HarnessConfig::default())?;
//!
//!     harness
//!         .process_message(0, "the unit price is 12.50 euros", MessageType::Data)
//!         .await?;
//!     let total = harness
//!         .process_message(1, "compute the price of 4 units", MessageType::Auto)
//!         .await?;
//!     println!("{:?}", total);
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{Local, Utc};
use futures_util::stream::{self, Stream};
use rhai::{Array, Dynamic, FnPtr, Map};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::promptloom::config::HarnessConfig;
use crate::promptloom::errand::{ErrandProfile, MultipleChoiceErrand};
use crate::promptloom::error::HarnessError;
use crate::promptloom::extract::{
    extract_function_definitions, rename_first_identifier, sanitize_code,
    with_docstring_addendum,
};
use crate::promptloom::lm_client::{LmClient, TracedClient};
use crate::promptloom::namespace::{Namespace, NamespaceSeed, LANGUAGE_MODEL_DOCSTRING};
use crate::promptloom::skill::{Skill, SkillStore};
use crate::promptloom::tiding::{Tiding, TidingStore};
use crate::promptloom::trace::Trace;

/// The closed set of message types.
///
/// `Auto` resolves to one of the concrete types via classification.
/// `GeneratingRoutine` is the only type that yields streaming
/// notifications; all others return a single terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auto,
    Code,
    CodeSkill,
    Routine,
    GeneratingRoutine,
    RoutineSkill,
    Query,
    QuerySkill,
    Data,
}

impl MessageType {
    /// Every concrete type, i.e. the closed set minus `auto`. This is also
    /// the classifier's choice set.
    pub const CONCRETE: [MessageType; 8] = [
        MessageType::Code,
        MessageType::CodeSkill,
        MessageType::Routine,
        MessageType::GeneratingRoutine,
        MessageType::RoutineSkill,
        MessageType::Query,
        MessageType::QuerySkill,
        MessageType::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Auto => "auto",
            MessageType::Code => "code",
            MessageType::CodeSkill => "code_skill",
            MessageType::Routine => "routine",
            MessageType::GeneratingRoutine => "generating_routine",
            MessageType::RoutineSkill => "routine_skill",
            MessageType::Query => "query",
            MessageType::QuerySkill => "query_skill",
            MessageType::Data => "data",
        }
    }

    /// Parse a type label; anything outside the closed set is
    /// [`HarnessError::InvalidType`].
    pub fn parse(label: &str) -> Result<MessageType, HarnessError> {
        match label {
            "auto" => Ok(MessageType::Auto),
            "code" => Ok(MessageType::Code),
            "code_skill" => Ok(MessageType::CodeSkill),
            "routine" => Ok(MessageType::Routine),
            "generating_routine" => Ok(MessageType::GeneratingRoutine),
            "routine_skill" => Ok(MessageType::RoutineSkill),
            "query" => Ok(MessageType::Query),
            "query_skill" => Ok(MessageType::QuerySkill),
            "data" => Ok(MessageType::Data),
            other => Err(HarnessError::InvalidType(format!(
                "'{}'; must be one of 'auto', 'code', 'code_skill', 'routine', \
                 'generating_routine', 'routine_skill', 'query', 'query_skill', 'data'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification forwarded from a streaming routine.
///
/// `payload` carries the routine's full notification map verbatim; `kind`
/// and `description` are the two fields every notification is expected to
/// have, lifted out for convenience.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: String,
    pub description: String,
    pub payload: serde_json::Value,
}

impl Notification {
    fn from_map(map: &Map) -> Notification {
        Notification {
            kind: map.get("type").map(dynamic_to_string).unwrap_or_default(),
            description: map
                .get("description")
                .map(dynamic_to_string)
                .unwrap_or_default(),
            payload: serde_json::to_value(&Dynamic::from(map.clone()))
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Type alias for the lazy notification sequence of a streaming routine.
pub type NotificationStream =
    Pin<Box<dyn Stream<Item = Result<Notification, HarnessError>> + Send>>;

fn dynamic_to_string(value: &Dynamic) -> String {
    value
        .clone()
        .into_string()
        .unwrap_or_else(|_| value.to_string())
}

/// Designation-keyed LM client selection: a default client answers every
/// errand unless an override is registered for its designation.
#[derive(Clone)]
pub struct ClientProfile {
    default_client: Arc<dyn LmClient>,
    overrides: HashMap<String, Arc<dyn LmClient>>,
}

impl ClientProfile {
    pub fn new(default_client: Arc<dyn LmClient>) -> Self {
        ClientProfile {
            default_client,
            overrides: HashMap::new(),
        }
    }

    pub fn set_override(&mut self, designation: impl Into<String>, client: Arc<dyn LmClient>) {
        self.overrides.insert(designation.into(), client);
    }

    pub fn get(&self, designation: &str) -> Arc<dyn LmClient> {
        self.overrides
            .get(designation)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_client))
    }
}

/// What a synthesis pipeline produced for one message.
struct Synthesis {
    skills: Vec<Skill>,
    invocation: Option<String>,
    descriptions: HashMap<String, String>,
}

impl Synthesis {
    fn empty() -> Self {
        Synthesis {
            skills: Vec::new(),
            invocation: None,
            descriptions: HashMap::new(),
        }
    }
}

/// Session state behind the harness: the two stores, the namespace, and the
/// high-water message id.
struct SessionState {
    skills: SkillStore,
    tidings: TidingStore,
    namespace: Namespace,
    last_mid: i64,
}

/// A single-session natural-language program harness.
pub struct Harness {
    instance_id: String,
    config: HarnessConfig,
    errands: ErrandProfile,
    clients: ClientProfile,
    runtime_client: Arc<dyn LmClient>,
    compilation_trace: Trace,
    execution_trace: Trace,
    state: Arc<Mutex<SessionState>>,
}

impl Harness {
    /// Create a session with a timestamped instance id.
    pub fn new(client: Arc<dyn LmClient>, config: HarnessConfig) -> Result<Self, HarnessError> {
        let instance_id = Local::now().format("%Y%m%d_%H-%M-%S").to_string();
        Self::new_with_instance_id(client, config, instance_id)
    }

    /// Create a session under an explicit instance id (used by front ends
    /// that key sessions themselves).
    pub fn new_with_instance_id(
        client: Arc<dyn LmClient>,
        config: HarnessConfig,
        instance_id: String,
    ) -> Result<Self, HarnessError> {
        let compilation_trace = config
            .compilation_trace
            .open(&config.compilation_log_path(&instance_id))?;
        let execution_trace = config
            .execution_trace
            .open(&config.execution_log_path(&instance_id))?;

        // Synthesis traffic is compilation activity; runtime `language_model`
        // calls from inside synthesized code are execution activity.
        let errand_client: Arc<dyn LmClient> = Arc::new(TracedClient::new(
            Arc::clone(&client),
            compilation_trace.clone(),
        ));
        let runtime_client: Arc<dyn LmClient> =
            Arc::new(TracedClient::new(client, execution_trace.clone()));

        let state = Self::bootstrap_state(&runtime_client, &config, &instance_id, &execution_trace);

        Ok(Harness {
            instance_id,
            errands: ErrandProfile::default(),
            clients: ClientProfile::new(errand_client),
            runtime_client,
            compilation_trace,
            execution_trace,
            state: Arc::new(Mutex::new(state)),
            config,
        })
    }

    /// Replace the errand profile (prompt-iteration workflow).
    pub fn with_errand_profile(mut self, errands: ErrandProfile) -> Self {
        self.errands = errands;
        self
    }

    /// Route one errand designation to a dedicated client. The override is
    /// wrapped with the compilation trace like the default client.
    pub fn with_client_override(
        mut self,
        designation: impl Into<String>,
        client: Arc<dyn LmClient>,
    ) -> Self {
        let traced: Arc<dyn LmClient> =
            Arc::new(TracedClient::new(client, self.compilation_trace.clone()));
        self.clients.set_override(designation, traced);
        self
    }

    fn bootstrap_state(
        runtime_client: &Arc<dyn LmClient>,
        config: &HarnessConfig,
        instance_id: &str,
        execution_trace: &Trace,
    ) -> SessionState {
        let seed = NamespaceSeed {
            language_model: Arc::clone(runtime_client),
            completion_defaults: config.completion_defaults.clone(),
            search_api_key: config.search_api_key.clone(),
        };
        let namespace = Namespace::new(&seed);

        let mut skills = SkillStore::default();
        skills.insert(Skill {
            name: "language_model".to_string(),
            script_name: "language_model".to_string(),
            docstring: LANGUAGE_MODEL_DOCSTRING.to_string(),
            code: String::new(),
            source_message: String::new(),
            source_mid: None,
        });

        let mut tidings = TidingStore::default();
        tidings.set_content_truncation(config.tiding_content_truncation);

        execution_trace.write_separator();
        execution_trace.write(&format!(
            "Creating new instance with id {} at {}",
            instance_id,
            Utc::now()
        ));
        execution_trace.write("New instance created; skills, tidings, and globals erased");
        execution_trace.write_separator();

        SessionState {
            skills,
            tidings,
            namespace,
            last_mid: -1,
        }
    }

    /// Drop all skills, tidings, and namespace contents back to the
    /// bootstrap state.
    pub fn reset(&self) {
        let fresh = Self::bootstrap_state(
            &self.runtime_client,
            &self.config,
            &self.instance_id,
            &self.execution_trace,
        );
        *self.state.lock().unwrap() = fresh;
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Id of the last successfully committed message, `-1` before any.
    pub fn last_mid(&self) -> i64 {
        self.state.lock().unwrap().last_mid
    }

    /// Snapshot of a stored skill by script name.
    pub fn skill(&self, script_name: &str) -> Option<Skill> {
        self.state.lock().unwrap().skills.get(script_name).cloned()
    }

    /// Snapshot of a stored tiding by script name.
    pub fn tiding(&self, script_name: &str) -> Option<Tiding> {
        self.state.lock().unwrap().tidings.get(script_name).cloned()
    }

    /// Script names of all stored skills, in insertion order.
    pub fn skill_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .skills
            .iter()
            .map(|skill| skill.script_name.clone())
            .collect()
    }

    /// Whether a function of this name is installed in the namespace
    /// library.
    pub fn has_namespace_fn(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespace.contains_fn(name)
    }

    /// Whether a variable of this name exists in the persistent namespace
    /// scope.
    pub fn has_namespace_global(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespace.contains_global(name)
    }

    /// The session context as JSON: last mid, tidings, and the plainly
    /// serializable namespace globals.
    pub fn context_snapshot(&self) -> serde_json::Value {
        let st = self.state.lock().unwrap();
        let tidings: serde_json::Map<String, serde_json::Value> = st
            .tidings
            .iter()
            .map(|tiding| (tiding.script_name.clone(), tiding.to_json()))
            .collect();
        serde_json::json!({
            "mid": st.last_mid,
            "tidings": tidings,
            "system_globals": st.namespace.snapshot_globals(),
        })
    }

    // ── Terminal flow ─────────────────────────────────────────────────────

    /// Process one terminal message and return the invocation's `__output`
    /// (or `None` when nothing was assigned).
    pub async fn process_message(
        &self,
        mid: u64,
        content: &str,
        message_type: MessageType,
    ) -> Result<Option<serde_json::Value>, HarnessError> {
        if content.trim().is_empty() {
            return Err(HarnessError::EmptyMessage);
        }
        let resolved = self.resolve_type(content, message_type).await?;

        match resolved {
            MessageType::Code => {
                let synthesis = self.synthesize_code(mid, content).await?;
                self.execute_terminal(mid, synthesis, false).await
            }
            MessageType::CodeSkill => {
                let synthesis = self.synthesize_code_skill(mid, content).await?;
                self.execute_terminal(mid, synthesis, false).await
            }
            MessageType::Routine => {
                let synthesis = self.synthesize_routine(mid, content, false).await?;
                self.execute_terminal(mid, synthesis, false).await
            }
            MessageType::Data => {
                let synthesis = self.synthesize_data(content).await?;
                self.execute_terminal(mid, synthesis, true).await
            }
            MessageType::GeneratingRoutine => Err(HarnessError::InvalidType(
                "generating_routine messages must be processed with process_message_streaming"
                    .to_string(),
            )),
            MessageType::RoutineSkill | MessageType::Query | MessageType::QuerySkill => {
                Err(HarnessError::NotImplemented(resolved.as_str().to_string()))
            }
            MessageType::Auto => Err(HarnessError::InvalidType(
                "classification did not resolve 'auto'".to_string(),
            )),
        }
    }

    // ── Streaming flow ────────────────────────────────────────────────────

    /// Process one `generating_routine` message, returning a lazy stream of
    /// its progress notifications. Tidings are committed only when the
    /// routine's `final` element arrives; dropping the stream cancels the
    /// routine between notifications without committing anything.
    pub async fn process_message_streaming(
        &self,
        mid: u64,
        content: &str,
        message_type: MessageType,
    ) -> Result<NotificationStream, HarnessError> {
        if content.trim().is_empty() {
            return Err(HarnessError::EmptyMessage);
        }
        let resolved = self.resolve_type(content, message_type).await?;
        if resolved != MessageType::GeneratingRoutine {
            return Err(HarnessError::InvalidType(format!(
                "streaming flow requires a generating_routine message, got '{}'",
                resolved.as_str()
            )));
        }

        let synthesis = self.synthesize_routine(mid, content, true).await?;
        self.log_compilation_result(mid, &synthesis);
        if synthesis.skills.is_empty() {
            return Err(HarnessError::SynthesisEmpty);
        }
        self.install_skills(synthesis.skills.clone()).await?;

        let invocation = match synthesis.invocation.clone() {
            Some(inv) if !inv.trim().is_empty() => inv,
            _ => return Err(HarnessError::SynthesisEmpty),
        };

        let outcome = self.exec_invocation_blocking(invocation).await?;
        let generator = outcome.generator().ok_or_else(|| {
            HarnessError::Invocation("invocation did not bind __generator".to_string())
        })?;

        // Capacity 1 keeps the producer at most one notification ahead of
        // the consumer, so cancellation (dropping the stream) takes effect
        // between notifications.
        let (tx, rx) = mpsc::channel::<Result<Notification, HarnessError>>(1);
        let state = Arc::clone(&self.state);
        let execution_trace = self.execution_trace.clone();
        let descriptions = synthesis.descriptions;
        let max_steps = self.config.max_generator_steps;
        tokio::task::spawn_blocking(move || {
            drive_generator(
                state,
                execution_trace,
                descriptions,
                generator,
                mid,
                max_steps,
                tx,
            );
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    // ── Classification ────────────────────────────────────────────────────

    async fn resolve_type(
        &self,
        content: &str,
        message_type: MessageType,
    ) -> Result<MessageType, HarnessError> {
        if message_type == MessageType::Auto {
            self.classify(content).await
        } else {
            Ok(message_type)
        }
    }

    /// Decide the message type from the content via the classification
    /// errand.
    async fn classify(&self, message: &str) -> Result<MessageType, HarnessError> {
        let errand = self.errands.get("message_type")?.clone();
        let choices: Vec<String> = MessageType::CONCRETE
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        let chooser = MultipleChoiceErrand::new(errand, choices);
        let client = self.clients.get("message_type");

        let choice = chooser
            .run(
                client.as_ref(),
                &[("message", message)],
                &self.config.completion_defaults,
            )
            .await?;

        match choice {
            Some(label) => MessageType::parse(&label),
            None => Err(HarnessError::ClassificationFailed(preview(message))),
        }
    }

    // ── Synthesis pipelines ───────────────────────────────────────────────

    async fn run_errand(
        &self,
        designation: &str,
        args: &[(&str, &str)],
    ) -> Result<String, HarnessError> {
        let errand = self.errands.get(designation)?;
        let client = self.clients.get(designation);
        errand
            .run(client.as_ref(), args, &self.config.completion_defaults)
            .await
    }

    async fn synthesize_code(&self, mid: u64, message: &str) -> Result<Synthesis, HarnessError> {
        let serialized_tidings = self.state.lock().unwrap().tidings.serialize_for_prompt();

        let raw = self
            .run_errand(
                "message_code_processing",
                &[("message", message), ("tidings", &serialized_tidings)],
            )
            .await?;
        let code = sanitize_code(&raw);
        let code = rename_first_identifier(&code, "code", &format!("message_{}_code", mid));

        let engine = self.state.lock().unwrap().namespace.engine_arc();
        let defs = extract_function_definitions(&engine, &code);
        let principal = match defs.first() {
            Some(def) => with_docstring_addendum(def, mid),
            // No parsable function: the message produced no skill. This is
            // not fatal for a terminal flow.
            None => return Ok(Synthesis::empty()),
        };

        let skill = Skill {
            name: principal.script_name.clone(),
            script_name: principal.script_name.clone(),
            docstring: principal.docstring.clone(),
            code: principal.code.clone(),
            source_message: message.to_string(),
            source_mid: Some(mid),
        };

        let invocation_raw = self
            .run_errand(
                "message_code_call",
                &[
                    ("message", message),
                    ("code", &skill.code),
                    ("tidings", &serialized_tidings),
                ],
            )
            .await?;
        let invocation = sanitize_code(&invocation_raw);

        let descriptions_raw = self
            .run_errand(
                "message_code_variables",
                &[
                    ("message", message),
                    ("code", &skill.code),
                    ("tidings", &serialized_tidings),
                ],
            )
            .await?;

        Ok(Synthesis {
            skills: vec![skill],
            invocation: Some(invocation),
            descriptions: parse_variable_descriptions(&descriptions_raw),
        })
    }

    async fn synthesize_code_skill(
        &self,
        mid: u64,
        message: &str,
    ) -> Result<Synthesis, HarnessError> {
        // Skills are supposed to be pure functions, so no tidings context.
        let raw = self
            .run_errand("message_code_skill_processing", &[("message", message)])
            .await?;
        let code = sanitize_code(&raw);

        let engine = self.state.lock().unwrap().namespace.engine_arc();
        let skills = extract_function_definitions(&engine, &code)
            .iter()
            .map(|def| {
                let def = with_docstring_addendum(def, mid);
                Skill {
                    name: def.script_name.clone(),
                    script_name: def.script_name.clone(),
                    docstring: def.docstring.clone(),
                    code: def.code.clone(),
                    source_message: message.to_string(),
                    source_mid: Some(mid),
                }
            })
            .collect();

        Ok(Synthesis {
            skills,
            invocation: None,
            descriptions: HashMap::new(),
        })
    }

    async fn synthesize_routine(
        &self,
        mid: u64,
        message: &str,
        generating: bool,
    ) -> Result<Synthesis, HarnessError> {
        let (serialized_skills, serialized_tidings) = {
            let st = self.state.lock().unwrap();
            (
                st.skills.serialize_for_prompt(),
                st.tidings.serialize_for_prompt(),
            )
        };

        let processing = if generating {
            "message_generating_routine_processing"
        } else {
            "message_routine_processing"
        };
        let raw = self
            .run_errand(
                processing,
                &[
                    ("message", message),
                    ("skills", &serialized_skills),
                    ("tidings", &serialized_tidings),
                ],
            )
            .await?;
        let code = sanitize_code(&raw);
        let code =
            rename_first_identifier(&code, "code", &format!("message_{}_routine_code", mid));

        let engine = self.state.lock().unwrap().namespace.engine_arc();
        let defs = extract_function_definitions(&engine, &code);
        let principal = match defs.first() {
            Some(def) => with_docstring_addendum(def, mid),
            None => return Ok(Synthesis::empty()),
        };

        let skill = Skill {
            name: principal.script_name.clone(),
            script_name: principal.script_name.clone(),
            docstring: principal.docstring.clone(),
            code: principal.code.clone(),
            source_message: message.to_string(),
            source_mid: Some(mid),
        };

        let call = if generating {
            "message_generating_routine_call"
        } else {
            "message_routine_call"
        };
        let invocation_raw = self
            .run_errand(
                call,
                &[
                    ("message", message),
                    ("code", &skill.code),
                    ("tidings", &serialized_tidings),
                ],
            )
            .await?;
        let invocation = sanitize_code(&invocation_raw);

        let descriptions_raw = self
            .run_errand(
                "message_routine_variables",
                &[
                    ("message", message),
                    ("code", &skill.code),
                    ("tidings", &serialized_tidings),
                ],
            )
            .await?;

        Ok(Synthesis {
            skills: vec![skill],
            invocation: Some(invocation),
            descriptions: parse_variable_descriptions(&descriptions_raw),
        })
    }

    async fn synthesize_data(&self, message: &str) -> Result<Synthesis, HarnessError> {
        let raw = self
            .run_errand("message_data_processing", &[("message", message)])
            .await?;

        Ok(Synthesis {
            skills: Vec::new(),
            invocation: Some(sanitize_code(&raw)),
            descriptions: HashMap::new(),
        })
    }

    // ── Install / invoke / commit ─────────────────────────────────────────

    fn log_compilation_result(&self, mid: u64, synthesis: &Synthesis) {
        let trace = &self.compilation_trace;
        trace.write_separator();
        trace.write(&format!("Compiled message {} at {}", mid, Utc::now()));
        if let Some(invocation) = &synthesis.invocation {
            trace.write(&format!("Invocation code: {}", invocation));
        }
        if !synthesis.descriptions.is_empty() {
            trace.write(&format!("Variable descriptions: {:?}", synthesis.descriptions));
        }
        for skill in &synthesis.skills {
            trace.write(&"*".repeat(20));
            trace.write(&format!("Skill name: {}", skill.name));
            trace.write(&format!("Script name: {}", skill.script_name));
            trace.write(&format!("Fingerprint: {}", skill.fingerprint_hex()));
            trace.write(&format!("Docstring:\n{}", skill.docstring));
            trace.write(&"-".repeat(20));
            trace.write(&format!("Code:\n{}", skill.code));
            trace.write(&"-".repeat(20));
            trace.write(&format!("Source message:\n{}", skill.source_message));
        }
        trace.write_separator();
    }

    /// Install skills on a blocking thread: a skill's top-level statements
    /// may call back into `language_model`, which must not block an async
    /// worker.
    async fn install_skills(&self, skills: Vec<Skill>) -> Result<(), HarnessError> {
        if skills.is_empty() {
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut st = state.lock().unwrap();
            for skill in skills {
                // A byte-identical reinstall is a no-op on the namespace.
                if st.skills.contains_identical(&skill) {
                    continue;
                }
                st.namespace.install(&skill.code)?;
                st.skills.insert(skill);
            }
            Ok(())
        })
        .await
        .map_err(|err| HarnessError::Invocation(format!("install task failed: {}", err)))?
    }

    async fn exec_invocation_blocking(
        &self,
        invocation: String,
    ) -> Result<crate::promptloom::namespace::InvocationOutcome, HarnessError> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let st = state.lock().unwrap();
            let bindings: Vec<(String, Dynamic)> = st
                .tidings
                .iter()
                .map(|tiding| (tiding.script_name.clone(), tiding.content.clone()))
                .collect();
            st.namespace.exec_invocation(&invocation, &bindings)
        })
        .await
        .map_err(|err| HarnessError::Invocation(format!("invocation task failed: {}", err)))?
    }

    async fn execute_terminal(
        &self,
        mid: u64,
        synthesis: Synthesis,
        collect_plain_vars: bool,
    ) -> Result<Option<serde_json::Value>, HarnessError> {
        self.log_compilation_result(mid, &synthesis);
        self.install_skills(synthesis.skills.clone()).await?;

        let invocation = match synthesis.invocation.clone() {
            Some(inv) if !inv.trim().is_empty() => inv,
            // Nothing to execute: a skill-only message, or a synthesis that
            // produced no parsable function. The message still commits.
            _ => {
                self.state.lock().unwrap().last_mid = mid as i64;
                return Ok(None);
            }
        };

        let outcome = self.exec_invocation_blocking(invocation).await?;
        let output = outcome.output();

        // New tidings: plain top-level assignments (data loaders only),
        // then the `__vars` map, which wins on name collisions.
        let mut new_vars: Vec<(String, Dynamic)> = if collect_plain_vars {
            outcome.new_bindings()
        } else {
            Vec::new()
        };
        if let Some(vars) = outcome.vars() {
            for (name, value) in vars {
                let name = name.to_string();
                new_vars.retain(|(existing, _)| existing != &name);
                new_vars.push((name, value));
            }
        }

        {
            let mut st = self.state.lock().unwrap();
            for (name, value) in new_vars {
                let description = synthesis.descriptions.get(&name).cloned().unwrap_or_default();
                st.tidings.upsert(Tiding {
                    natural_name: name.clone(),
                    script_name: name,
                    description,
                    content: value,
                });
            }
            st.last_mid = mid as i64;
        }

        match output {
            Some(value) => serde_json::to_value(&value)
                .map(Some)
                .map_err(|err| {
                    HarnessError::Invocation(format!("__output is not serializable: {}", err))
                }),
            None => Ok(None),
        }
    }
}

/// Producer loop of the streaming flow. Runs on a blocking thread, pulling
/// notification maps from the generator (eager array or lazy closure) and
/// forwarding them over the channel until the `final` element commits the
/// routine's tidings.
fn drive_generator(
    state: Arc<Mutex<SessionState>>,
    execution_trace: Trace,
    descriptions: HashMap<String, String>,
    generator: Dynamic,
    mid: u64,
    max_steps: usize,
    tx: mpsc::Sender<Result<Notification, HarnessError>>,
) {
    enum Source {
        Eager(std::vec::IntoIter<Dynamic>),
        Lazy(FnPtr),
    }

    let mut source = if generator.is::<Array>() {
        Source::Eager(generator.cast::<Array>().into_iter())
    } else if generator.is::<FnPtr>() {
        Source::Lazy(generator.cast::<FnPtr>())
    } else {
        let _ = tx.blocking_send(Err(HarnessError::Invocation(format!(
            "__generator must be an array or a closure, got {}",
            generator.type_name()
        ))));
        return;
    };

    let mut final_map: Option<Map> = None;
    for _ in 0..max_steps {
        let next = match &mut source {
            Source::Eager(iter) => iter.next(),
            Source::Lazy(fn_ptr) => {
                let step = {
                    let st = state.lock().unwrap();
                    st.namespace.call_generator_step(fn_ptr)
                };
                match step {
                    Ok(value) => {
                        if value.is_unit() {
                            None
                        } else {
                            Some(value)
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        return;
                    }
                }
            }
        };

        let element = match next {
            Some(element) => element,
            None => break,
        };
        let map = match element.try_cast::<Map>() {
            Some(map) => map,
            None => {
                let _ = tx.blocking_send(Err(HarnessError::Invocation(
                    "streaming notification is not a map".to_string(),
                )));
                return;
            }
        };

        let kind = map.get("type").map(dynamic_to_string).unwrap_or_default();
        if kind == "final" {
            final_map = Some(map);
            break;
        }

        if tx.blocking_send(Ok(Notification::from_map(&map))).is_err() {
            // Consumer dropped the stream between notifications. Commit
            // nothing; the trace records the cancellation.
            execution_trace.write(&format!(
                "Streaming routine for message {} cancelled before completion",
                mid
            ));
            return;
        }
    }

    match final_map {
        Some(map) => {
            let modified = map
                .get("modified_vars")
                .cloned()
                .and_then(|value| value.try_cast::<Map>())
                .unwrap_or_default();

            let mut st = state.lock().unwrap();
            for (name, value) in modified {
                let name = name.to_string();
                let description = descriptions.get(&name).cloned().unwrap_or_default();
                st.tidings.upsert(Tiding {
                    natural_name: name.clone(),
                    script_name: name,
                    description,
                    content: value,
                });
            }
            st.last_mid = mid as i64;
            execution_trace.write(&format!("Streaming routine for message {} completed", mid));
        }
        None => {
            let _ = tx.blocking_send(Err(HarnessError::MissingFinalNotification));
        }
    }
}

/// Parse the variable-descriptions errand output: one `name # description`
/// line per variable.
fn parse_variable_descriptions(raw: &str) -> HashMap<String, String> {
    let mut descriptions = HashMap::new();
    for line in raw.trim().lines() {
        if let Some(hash) = line.find('#') {
            let name = line[..hash].trim();
            let description = line[hash + 1..].trim();
            if !name.is_empty() {
                descriptions.insert(name.to_string(), description.to_string());
            }
        }
    }
    descriptions
}

fn preview(message: &str) -> String {
    let mut preview: String = message.chars().take(80).collect();
    if message.chars().count() > 80 {
        preview.push('…');
    }
    preview
}
