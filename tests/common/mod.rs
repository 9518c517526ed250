#![allow(dead_code)]

//! Scripted runtime double.
//!
//! Understands a tiny line-oriented subset of Python, enough to exercise the
//! protocol without an interpreter:
//!
//! ```text
//! name = expr          print(expr)          missive({"json": 1})
//! raise Kind("msg")    sleep(ms)
//! ```
//!
//! `expr` is a JSON literal, a global name, `a + b`, `a / b`, `input("p")` or
//! the awaited input form produced by the rewriter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use nagini::execution::ExecutionError;
use nagini::runtime::{CaptureSurface, InputPort, MemoryFs, Program, Runtime, RuntimeError, VirtualFs};
use nagini::{Controller, ControllerConfig, InitOptions};
use serde_json::Value;

const MISSIVE_TWICE: &str = "missive() can only be called once per execution. \
If you need to send multiple pieces of data, put them all in one dictionary.";

#[derive(Default)]
pub struct ScriptRuntime {
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) missive: Option<Value>,
    pub(crate) fs: MemoryFs,
    /// Fail `start` with this message.
    pub fail_start: Option<String>,
    /// Fail `load_packages` with this message.
    pub fail_packages: Option<String>,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

fn raised(kind: &str, message: impl Into<String>) -> ExecutionError {
    ExecutionError::new(kind, message)
}

fn string_literal(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(String::new());
    }
    match serde_json::from_str::<Value>(raw).ok()? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ScriptRuntime {
    async fn eval(&mut self, expr: &str, filename: &str, line: usize, input: Option<&dyn InputPort>) -> Result<Value, ExecutionError> {
        let expr = expr.trim();

        if let Some(rest) = expr.strip_prefix("(await __nagini_input__(").and_then(|r| r.strip_suffix("))")) {
            let prompt = string_literal(rest).ok_or_else(|| raised("SyntaxError", "bad prompt"))?;
            return self.read_input(&prompt, input).await;
        }
        if let Some(rest) = expr.strip_prefix("input(").and_then(|r| r.strip_suffix(')')) {
            let prompt = string_literal(rest).ok_or_else(|| raised("SyntaxError", "bad prompt"))?;
            return self.read_input(&prompt, input).await;
        }
        if let Some((left, right)) = expr.split_once(" + ") {
            let (left, right) = (self.atom(left)?, self.atom(right)?);
            return match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))),
                _ => Ok(Value::String(format!("{}{}", render(&left), render(&right)))),
            };
        }
        if let Some((left, right)) = expr.split_once(" / ") {
            let (a, b) = (self.atom(left)?, self.atom(right)?);
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            if b == 0.0 {
                self.stderr.push_str(&format!(
                    "Traceback (most recent call last):\n  File \"{filename}\", line {line}, in <module>\nZeroDivisionError: division by zero\n"
                ));
                return Err(raised("ZeroDivisionError", "division by zero"));
            }
            return Ok(Value::from(a / b));
        }
        self.atom(expr)
    }

    /// A JSON literal or a global name.
    fn atom(&self, expr: &str) -> Result<Value, ExecutionError> {
        let expr = expr.trim();
        if let Ok(value) = serde_json::from_str::<Value>(expr) {
            return Ok(value);
        }
        self.globals
            .get(expr)
            .cloned()
            .ok_or_else(|| raised("NameError", format!("name '{expr}' is not defined")))
    }

    async fn read_input(&mut self, prompt: &str, input: Option<&dyn InputPort>) -> Result<Value, ExecutionError> {
        self.stdout.push_str(prompt);
        let port = input.ok_or_else(|| raised("EOFError", "input is not available for this execution"))?;
        let value = port
            .request_input(prompt)
            .await
            .map_err(|err| raised("EOFError", err.to_string()))?;
        Ok(Value::String(value))
    }

    async fn exec(&mut self, program: Program<'_>, input: Option<&dyn InputPort>) -> Result<(), ExecutionError> {
        for (index, raw) in program.code.lines().enumerate() {
            let line = raw.trim();
            let number = index + 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("print(").and_then(|r| r.strip_suffix(')')) {
                let value = self.eval(rest, program.filename, number, input).await?;
                self.stdout.push_str(&render(&value));
                self.stdout.push('\n');
            } else if let Some(rest) = line.strip_prefix("missive(").and_then(|r| r.strip_suffix(')')) {
                if self.missive.is_some() {
                    return Err(raised("ValueError", MISSIVE_TWICE));
                }
                let value = self.eval(rest, program.filename, number, input).await?;
                self.missive = Some(value);
            } else if let Some(rest) = line.strip_prefix("sleep(").and_then(|r| r.strip_suffix(')')) {
                let ms = rest.trim().parse::<u64>().map_err(|_| raised("TypeError", "sleep expects ms"))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
            } else if let Some(rest) = line.strip_prefix("raise ") {
                let (kind, message) = rest.split_once('(').unwrap_or((rest, ")"));
                let message = string_literal(message.trim_end_matches(')')).unwrap_or_default();
                self.stderr.push_str(&format!("{kind}: {message}\n"));
                return Err(raised(kind, message));
            } else if let Some((name, expr)) = line.split_once(" = ") {
                let value = self.eval(expr, program.filename, number, input).await?;
                self.globals.insert(name.trim().to_string(), value);
            } else {
                self.eval(line, program.filename, number, input).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureSurface for ScriptRuntime {
    async fn reset_captures(&mut self) -> Result<(), RuntimeError> {
        self.stdout.clear();
        self.stderr.clear();
        self.missive = None;
        Ok(())
    }

    async fn stdout(&mut self) -> Result<String, RuntimeError> {
        Ok(self.stdout.clone())
    }

    async fn stderr(&mut self) -> Result<String, RuntimeError> {
        Ok(self.stderr.clone())
    }

    async fn missive(&mut self) -> Result<Option<Value>, RuntimeError> {
        Ok(self.missive.clone())
    }

    async fn figures(&mut self) -> Result<Vec<String>, RuntimeError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl Runtime for ScriptRuntime {
    type Binding = Value;

    async fn start(&mut self) -> Result<(), RuntimeError> {
        match &self.fail_start {
            Some(message) => Err(RuntimeError::Start(message.clone())),
            None => Ok(()),
        }
    }

    async fn load_packages(&mut self, _packages: &[String]) -> Result<(), RuntimeError> {
        match &self.fail_packages {
            Some(message) => Err(RuntimeError::Failed(message.clone())),
            None => Ok(()),
        }
    }

    async fn install_packages(&mut self, _packages: &[String]) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn run(&mut self, program: Program<'_>) -> Result<(), ExecutionError> {
        self.exec(program, None).await
    }

    async fn run_async(&mut self, program: Program<'_>, input: &dyn InputPort) -> Result<(), ExecutionError> {
        self.exec(program, Some(input)).await
    }

    async fn get_global(&mut self, name: &str) -> Result<Option<Value>, RuntimeError> {
        Ok(self.globals.get(name).cloned())
    }

    async fn set_global(&mut self, name: &str, value: &Value) -> Result<(), RuntimeError> {
        self.globals.insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn restore_global(&mut self, name: &str, binding: Value) -> Result<(), RuntimeError> {
        self.globals.insert(name.to_string(), binding);
        Ok(())
    }

    async fn delete_global(&mut self, name: &str) -> Result<(), RuntimeError> {
        self.globals.remove(name);
        Ok(())
    }

    async fn global_names(&mut self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.globals.keys().cloned().collect())
    }

    fn fs(&mut self) -> &mut dyn VirtualFs {
        &mut self.fs
    }
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        execution_timeout: Duration::from_secs(5),
        fs_timeout: Duration::from_secs(5),
        ready_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    }
}

/// A ready controller over a fresh [`ScriptRuntime`].
pub async fn ready_controller() -> nagini::Result<Controller> {
    Controller::start(ScriptRuntime::new(), InitOptions::new(), test_config()).await
}
