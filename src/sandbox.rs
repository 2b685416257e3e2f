//! Sandboxed evaluation of template code.
//!
//! Transform and URL-building bodies arrive from the control plane as Rhai
//! scripts. Each call builds a fresh engine that only sees the whitelisted
//! argument bindings, has no module loader, no `eval`, no console output, and
//! is terminated once its wall-clock budget is spent.
//!
//! Calls are synchronous and CPU-bound; async callers should run them on the
//! blocking pool.

use std::time::{Duration, Instant};

use rhai::{
    Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope,
    module_resolvers::DummyModuleResolver,
    serde::{from_dynamic, to_dynamic},
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::CollectorError;

/// Default execution budget for one evaluation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

/// Names of the bindings a template body can see.
const BINDINGS: [&str; 5] = ["ctx", "res", "subject", "subjects", "aspects"];

const MAX_CALL_LEVELS: usize = 32;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
const MAX_STRING_SIZE: usize = 1024 * 1024;
const MAX_ARRAY_SIZE: usize = 100_000;
const MAX_MAP_SIZE: usize = 100_000;

/// Which post-validation applies to an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Eval,
    Transform,
    ToUrl,
}

/// Evaluates untrusted template code against a closed set of bindings.
#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate `function_body` and return whatever it produces.
    pub fn safe_eval(&self, function_body: &str, args: &Value) -> Result<Value, CollectorError> {
        let bindings = validate_args(args, Mode::Eval)?;
        self.run(function_body, bindings)
    }

    /// Evaluate a transform body; the result must be an array of records
    /// each carrying a string `name`.
    pub fn safe_transform(
        &self,
        function_body: &str,
        args: &Value,
    ) -> Result<Vec<Value>, CollectorError> {
        let bindings = validate_args(args, Mode::Transform)?;
        let result = self.run(function_body, bindings)?;
        validate_transform_result(result)
    }

    /// Evaluate a URL-building body; the result must be a string.
    pub fn safe_to_url(&self, function_body: &str, args: &Value) -> Result<String, CollectorError> {
        let bindings = validate_args(args, Mode::ToUrl)?;
        match self.run(function_body, bindings)? {
            Value::String(url) => Ok(url),
            other => Err(CollectorError::to_url(format!(
                "The url returned by the toUrl function must be a string, got {}",
                json_type_name(&other)
            ))),
        }
    }

    fn run(&self, function_body: &str, bindings: &Map<String, Value>) -> Result<Value, CollectorError> {
        let engine = self.build_engine();

        let ast = engine
            .compile(function_body)
            .map_err(|err| CollectorError::function_body("SyntaxError", err.to_string()))?;

        let mut scope = Scope::new();
        for name in BINDINGS {
            if let Some(value) = bindings.get(name) {
                let dynamic = to_dynamic(value)
                    .map_err(|err| CollectorError::args(format!("cannot bind {}: {}", name, err)))?;
                scope.push_dynamic(name, dynamic);
            }
        }

        let started = Instant::now();
        let result = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|err| self.map_eval_error(*err))?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sandbox evaluation finished"
        );

        from_dynamic::<Value>(&result)
            .map_err(|err| CollectorError::function_body("TypeError", err.to_string()))
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.disable_symbol("print");
        engine.disable_symbol("debug");
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});

        engine.set_max_call_levels(MAX_CALL_LEVELS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
        engine.set_max_string_size(MAX_STRING_SIZE);
        engine.set_max_array_size(MAX_ARRAY_SIZE);
        engine.set_max_map_size(MAX_MAP_SIZE);

        let deadline = Instant::now() + self.timeout;
        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        engine.register_fn(
            "parse_json",
            |text: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
                let value: Value = serde_json::from_str(text.as_str()).map_err(|err| {
                    runtime_error(format!("parse_json: {}", err))
                })?;
                to_dynamic(value)
            },
        );
        engine.register_fn(
            "to_json",
            |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
                let value: Value = from_dynamic(&value)?;
                serde_json::to_string(&value)
                    .map_err(|err| runtime_error(format!("to_json: {}", err)))
            },
        );

        engine
    }

    fn map_eval_error(&self, error: EvalAltResult) -> CollectorError {
        match error {
            EvalAltResult::ErrorTerminated(_, _) => CollectorError::function_body(
                "TimeoutError",
                format!(
                    "Script execution timed out after {} ms",
                    self.timeout.as_millis()
                ),
            ),
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => self.map_eval_error(*inner),
            EvalAltResult::ErrorRuntime(value, _) => {
                CollectorError::function_body("Error", value.to_string())
            }
            other => CollectorError::function_body(error_kind(&other), other.to_string()),
        }
    }
}

fn error_kind(error: &EvalAltResult) -> &'static str {
    match error {
        EvalAltResult::ErrorParsing(..) => "SyntaxError",
        EvalAltResult::ErrorVariableNotFound(..)
        | EvalAltResult::ErrorPropertyNotFound(..)
        | EvalAltResult::ErrorFunctionNotFound(..)
        | EvalAltResult::ErrorModuleNotFound(..) => "ReferenceError",
        EvalAltResult::ErrorMismatchDataType(..)
        | EvalAltResult::ErrorMismatchOutputType(..)
        | EvalAltResult::ErrorIndexingType(..) => "TypeError",
        EvalAltResult::ErrorArrayBounds(..)
        | EvalAltResult::ErrorStringBounds(..)
        | EvalAltResult::ErrorArithmetic(..)
        | EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)
        | EvalAltResult::ErrorDataTooLarge(..) => "RangeError",
        _ => "Error",
    }
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(message.into(), Position::NONE).into()
}

/// Check argument structure before anything is evaluated.
fn validate_args(args: &Value, mode: Mode) -> Result<&Map<String, Value>, CollectorError> {
    let Value::Object(map) = args else {
        return Err(CollectorError::args(format!(
            "args must be an object, got {}",
            json_type_name(args)
        )));
    };

    match map.get("ctx") {
        Some(Value::Object(_)) => {}
        Some(other) => {
            return Err(CollectorError::args(format!(
                "args.ctx must be an object, got {}",
                json_type_name(other)
            )));
        }
        None => return Err(CollectorError::args("args.ctx is required")),
    }

    if mode == Mode::Eval {
        return Ok(map);
    }

    match (map.get("subject"), map.get("subjects")) {
        (Some(_), Some(_)) => {
            return Err(CollectorError::args(
                "args must contain only one of subject or subjects",
            ));
        }
        (None, None) => {
            return Err(CollectorError::args(
                "args must contain one of subject or subjects",
            ));
        }
        (Some(subject), None) => validate_subject(subject, "args.subject")?,
        (None, Some(Value::Array(subjects))) => {
            if subjects.is_empty() {
                return Err(CollectorError::args("args.subjects must not be empty"));
            }
            for (index, subject) in subjects.iter().enumerate() {
                validate_subject(subject, &format!("args.subjects[{}]", index))?;
            }
        }
        (None, Some(other)) => {
            return Err(CollectorError::args(format!(
                "args.subjects must be an array, got {}",
                json_type_name(other)
            )));
        }
    }

    if mode == Mode::Transform {
        match map.get("res") {
            Some(Value::Object(_)) => {}
            Some(other) => {
                return Err(CollectorError::args(format!(
                    "args.res must be an object, got {}",
                    json_type_name(other)
                )));
            }
            None => return Err(CollectorError::args("args.res is required")),
        }
        match map.get("aspects") {
            Some(Value::Array(_)) => {}
            Some(other) => {
                return Err(CollectorError::args(format!(
                    "args.aspects must be an array, got {}",
                    json_type_name(other)
                )));
            }
            None => return Err(CollectorError::args("args.aspects is required")),
        }
    }

    Ok(map)
}

fn validate_subject(subject: &Value, label: &str) -> Result<(), CollectorError> {
    match subject {
        Value::Object(map) if matches!(map.get("absolutePath"), Some(Value::String(_))) => Ok(()),
        Value::Object(_) => Err(CollectorError::args(format!(
            "{}.absolutePath must be a string",
            label
        ))),
        other => Err(CollectorError::args(format!(
            "{} must be an object, got {}",
            label,
            json_type_name(other)
        ))),
    }
}

fn validate_transform_result(result: Value) -> Result<Vec<Value>, CollectorError> {
    let Value::Array(items) = result else {
        return Err(CollectorError::transform(format!(
            "The transform function must return an array, got {}",
            json_type_name(&result)
        )));
    };

    for (index, item) in items.iter().enumerate() {
        let Value::Object(sample) = item else {
            return Err(CollectorError::transform(format!(
                "The transform function must return an array of objects; element {} is {}",
                index,
                json_type_name(item)
            )));
        };
        if !matches!(sample.get("name"), Some(Value::String(_))) {
            return Err(CollectorError::transform(format!(
                "Every sample must have a string name; element {} does not",
                index
            )));
        }
    }

    Ok(items)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
