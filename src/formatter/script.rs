//! Sandboxed JavaScript execution for formatter scripts
//!
//! Input keys become global variables, the script assigns its output to
//! `result`, and the value of `result` is returned as JSON. Execution runs
//! on the blocking pool and is bounded by a timeout.

use async_trait::async_trait;
use boa_engine::{Context, Source};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Execution bound for formatter scripts
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Loop iteration cap so a runaway script does not pin a thread forever
const LOOP_ITERATION_LIMIT: u64 = 50_000_000;

const CONSOLE_SHIM: &str = "globalThis.console = { log() {}, info() {}, warn() {}, error() {}, debug() {} };\n";
const RESULT_EPILOGUE: &str = "\n;(typeof result === 'undefined' ? null : result)";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script timed out after {0:?}")]
    Timeout(Duration),
    #[error("script error: {0}")]
    Execution(String),
    #[error("script result is not representable as JSON: {0}")]
    Conversion(String),
    #[error("script task failed: {0}")]
    Join(String),
}

/// Runs a script against an input map
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        script: &str,
        input: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ScriptError>;
}

/// [`ScriptRunner`] backed by the boa JavaScript engine
#[derive(Debug, Default, Clone, Copy)]
pub struct BoaScriptRunner;

impl BoaScriptRunner {
    fn prelude(input: &Map<String, Value>) -> String {
        let mut prelude = String::from(CONSOLE_SHIM);
        for (key, value) in input {
            // JSON text is a valid JavaScript literal
            let key = Value::String(key.clone());
            prelude.push_str(&format!("globalThis[{key}] = {value};\n"));
        }
        prelude
    }

    /// Synchronous evaluation, used on the blocking pool
    pub fn evaluate(script: &str, input: &Map<String, Value>) -> Result<Value, ScriptError> {
        let code = format!("{}{script}{RESULT_EPILOGUE}", Self::prelude(input));

        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);

        let value = context
            .eval(Source::from_bytes(code.as_bytes()))
            .map_err(|e| ScriptError::Execution(e.to_string()))?;
        value
            .to_json(&mut context)
            .map_err(|e| ScriptError::Conversion(e.to_string()))
    }
}

#[async_trait]
impl ScriptRunner for BoaScriptRunner {
    async fn run(
        &self,
        script: &str,
        input: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ScriptError> {
        let script = script.to_string();
        let task = tokio::task::spawn_blocking(move || Self::evaluate(&script, &input));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ScriptError::Join(e.to_string())),
            Err(_) => Err(ScriptError::Timeout(timeout)),
        }
    }
}
