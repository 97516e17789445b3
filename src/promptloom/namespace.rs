//! The persistent execution namespace.
//!
//! This is the core abstraction of the harness: a single mutable binding
//! environment that survives across messages, into which synthesized skills
//! are injected and against which invocation snippets run. It is realized as
//! an embedded Rhai engine plus two pieces of state:
//!
//! - a [`Scope`] holding session variables (the bootstrap `__messages`
//!   accumulator and any helper variables captured from skill sources), and
//! - an accumulated function-library [`AST`] holding every installed skill.
//!
//! Installing a skill merges its compiled functions into the library —
//! same-name functions are replaced, which is exactly the skill-replacement
//! rule — and evaluates its top-level statements once, merging any new
//! helper variables into the scope *without* overwriting existing bindings.
//!
//! Invocation snippets execute against a clone of the scope, pre-populated
//! with one binding per current tiding; the special names `__output`,
//! `__vars` and `__generator` are read back from the clone and the clone is
//! discarded, so invocations cannot corrupt the persistent scope.
//!
//! The bootstrap also registers host functions: `language_model(prompt)` /
//! `language_model(prompt, pre_prompt)` wrapping the session's LM client,
//! and `search_client(...)` + `client.search(query)` wrapping the web-search
//! contract. Host functions bridge into async Rust with
//! `tokio::runtime::Handle::block_on`, which is why invocation execution
//! always happens on a blocking thread (`tokio::task::spawn_blocking`).

use std::sync::Arc;

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, Map, Scope, AST};

use crate::promptloom::error::HarnessError;
use crate::promptloom::lm_client::{CompletionConfig, LmClient};
use crate::promptloom::search::SearchClient;

/// Docstring of the bootstrap `language_model` callable. Recorded in the
/// skill store so that routine-synthesis prompts can advertise it.
pub const LANGUAGE_MODEL_DOCSTRING: &str = "\
Sends a prompt to the session's language model and returns the response text.

Call as `language_model(prompt)` or `language_model(prompt, pre_prompt)`.
Guidelines for effective prompts:
- Use pre_prompt to assign a role to the language model (e.g. \"You are an expert report writer.\").
- Begin the prompt by asking for a specific task, name the parameters it operates on (e.g. \"CONTEXT\", \"ASSIGNMENT\"), and paste their values after blank lines.
- Specify the expected output format explicitly (e.g. \"Write a report in Markdown format. Do not output any other text.\").
- For long prompts, add a short list of reminders at the end restating the output format.";

/// Everything the bootstrap needs to seed a namespace.
pub struct NamespaceSeed {
    /// Client backing the bootstrap `language_model` callable.
    pub language_model: Arc<dyn LmClient>,
    /// Completion defaults applied to `language_model` calls.
    pub completion_defaults: CompletionConfig,
    /// API key baked into the zero-argument `search_client()` constructor.
    pub search_api_key: Option<String>,
}

/// Bridge a host future into the synchronous script engine.
///
/// Only legal off the async worker threads; the harness guarantees this by
/// executing every invocation inside `spawn_blocking`.
fn block_on_runtime<F, T>(future: F) -> Result<T, Box<EvalAltResult>>
where
    F: std::future::Future<Output = Result<T, HarnessError>>,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|_| -> Box<EvalAltResult> {
        "host function requires a tokio runtime".into()
    })?;
    handle
        .block_on(future)
        .map_err(|err| -> Box<EvalAltResult> { err.to_string().into() })
}

fn build_engine(seed: &NamespaceSeed) -> Engine {
    let mut engine = Engine::new();

    let client = Arc::clone(&seed.language_model);
    let defaults = seed.completion_defaults.clone();
    engine.register_fn(
        "language_model",
        move |prompt: &str| -> Result<String, Box<EvalAltResult>> {
            block_on_runtime(client.run(None, prompt, &defaults))
        },
    );

    let client = Arc::clone(&seed.language_model);
    let defaults = seed.completion_defaults.clone();
    engine.register_fn(
        "language_model",
        move |prompt: &str, pre_prompt: &str| -> Result<String, Box<EvalAltResult>> {
            block_on_runtime(client.run(Some(pre_prompt), prompt, &defaults))
        },
    );

    engine.register_type_with_name::<SearchClient>("SearchClient");
    engine.register_fn("search_client", |api_key: &str| SearchClient::new(api_key));
    let default_key = seed.search_api_key.clone().unwrap_or_default();
    engine.register_fn("search_client", move || SearchClient::new(&default_key));
    engine.register_fn(
        "search",
        |client: &mut SearchClient, query: &str| -> Result<Map, Box<EvalAltResult>> {
            let response = block_on_runtime(client.search(query))?;
            let dynamic = rhai::serde::to_dynamic(&response)?;
            dynamic
                .try_cast::<Map>()
                .ok_or_else(|| -> Box<EvalAltResult> { "search result is not a map".into() })
        },
    );

    engine
}

/// Result of executing an invocation snippet: the scope it ran in, and the
/// watermark separating pre-existing bindings from ones the snippet created.
pub struct InvocationOutcome {
    pub scope: Scope<'static>,
    pub watermark: usize,
}

impl InvocationOutcome {
    /// The `__output` binding, if the snippet assigned a non-unit value.
    pub fn output(&self) -> Option<Dynamic> {
        self.scope
            .get("__output")
            .cloned()
            .filter(|value| !value.is_unit())
    }

    /// The `__vars` binding, if the snippet assigned a map.
    pub fn vars(&self) -> Option<Map> {
        self.scope
            .get("__vars")
            .cloned()
            .and_then(|value| value.try_cast::<Map>())
    }

    /// The `__generator` binding, if the snippet assigned one.
    pub fn generator(&self) -> Option<Dynamic> {
        self.scope
            .get("__generator")
            .cloned()
            .filter(|value| !value.is_unit())
    }

    /// Identifiers the snippet created at the top level (excluding dunder
    /// names), in declaration order. This is how `data` loaders turn plain
    /// assignments into tidings.
    pub fn new_bindings(&self) -> Vec<(String, Dynamic)> {
        self.scope
            .iter()
            .skip(self.watermark)
            .filter(|(name, _, _)| !name.starts_with("__"))
            .map(|(name, _, value)| (name.to_string(), value))
            .collect()
    }
}

/// The session's execution namespace.
pub struct Namespace {
    engine: Arc<Engine>,
    scope: Scope<'static>,
    lib: AST,
}

impl Namespace {
    /// Seed a fresh namespace: the `__messages` accumulator plus the host
    /// functions registered on the engine.
    pub fn new(seed: &NamespaceSeed) -> Self {
        let engine = Arc::new(build_engine(seed));
        let mut scope = Scope::new();
        scope.push("__messages", Array::new());

        Namespace {
            engine,
            scope,
            lib: AST::empty(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_arc(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    /// Compile and install skill source: functions are merged into the
    /// library (replacing same-name predecessors), and helper variables
    /// created by top-level statements are merged into the scope unless a
    /// binding of that name already exists.
    pub fn install(&mut self, source: &str) -> Result<(), HarnessError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|err| HarnessError::Invocation(format!("skill failed to compile: {}", err)))?;

        // Run top-level statements with library functions in reach, then
        // diff the scope to find helper bindings the source introduced.
        let run_ast = self.lib.clone_functions_only().merge(&ast);
        let mut work = self.scope.clone();
        self.engine
            .run_ast_with_scope(&mut work, &run_ast)
            .map_err(|err| {
                HarnessError::Invocation(format!("skill top-level statements failed: {}", err))
            })?;

        for (name, _, value) in work.iter() {
            if !self.scope.contains(name) {
                self.scope.push_dynamic(name.to_string(), value);
            }
        }

        self.lib = self.lib.merge(&ast.clone_functions_only());
        Ok(())
    }

    /// Execute an invocation snippet against a clone of the namespace scope
    /// pre-populated with the given bindings (one per current tiding).
    pub fn exec_invocation(
        &self,
        invocation: &str,
        bindings: &[(String, Dynamic)],
    ) -> Result<InvocationOutcome, HarnessError> {
        let invocation_ast = self.engine.compile(invocation).map_err(|err| {
            HarnessError::Invocation(format!("invocation failed to compile: {}", err))
        })?;
        let run_ast = self.lib.clone_functions_only().merge(&invocation_ast);

        let mut scope = self.scope.clone();
        for (name, value) in bindings {
            // Pushing always shadows: the freshest tiding value wins.
            scope.push_dynamic(name.clone(), value.clone());
        }
        let watermark = scope.len();

        self.engine
            .run_ast_with_scope(&mut scope, &run_ast)
            .map_err(|err| HarnessError::Invocation(err.to_string()))?;

        Ok(InvocationOutcome { scope, watermark })
    }

    /// Pull the next element from a closure-shaped generator. A unit return
    /// means the sequence is exhausted.
    pub fn call_generator_step(&self, generator: &FnPtr) -> Result<Dynamic, HarnessError> {
        generator
            .call::<Dynamic>(&self.engine, &self.lib, ())
            .map_err(|err| HarnessError::Invocation(format!("generator step failed: {}", err)))
    }

    /// Whether a function of this name is installed in the library.
    pub fn contains_fn(&self, name: &str) -> bool {
        self.lib.iter_functions().any(|f| f.name == name)
    }

    /// Whether a variable of this name exists in the persistent scope.
    pub fn contains_global(&self, name: &str) -> bool {
        self.scope.contains(name)
    }

    /// Plainly-serializable, non-dunder, non-callable scope bindings, for
    /// context snapshots.
    pub fn snapshot_globals(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut globals = serde_json::Map::new();
        for (name, _, value) in self.scope.iter() {
            if name.starts_with("__") || value.is::<FnPtr>() || value.is_unit() {
                continue;
            }
            if let Ok(json) = serde_json::to_value(&value) {
                globals.insert(name.to_string(), json);
            }
        }
        globals
    }
}
