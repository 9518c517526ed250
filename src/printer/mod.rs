//! Printers for execution results: coloured text or JSON.

use std::io::{self, Write};

use owo_colors::OwoColorize;

use crate::execution::ExecutionResult;

pub struct ResultPrinter {
    /// Colour stderr/errors and label sections.
    pub pretty: bool,
    pub json: bool,
}

impl ResultPrinter {
    pub fn print(&self, result: &ExecutionResult) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write(&mut out, result)
    }

    pub fn write(&self, out: &mut impl Write, result: &ExecutionResult) -> io::Result<()> {
        if self.json {
            serde_json::to_writer_pretty(&mut *out, result)?;
            return writeln!(out);
        }

        if !result.stdout.is_empty() {
            write!(out, "{}", result.stdout)?;
            if !result.stdout.ends_with('\n') {
                writeln!(out)?;
            }
        }
        if !result.stderr.is_empty() {
            let text = result.stderr.trim_end();
            if self.pretty {
                writeln!(out, "{}", text.red())?;
            } else {
                writeln!(out, "{text}")?;
            }
        }
        if let Some(missive) = &result.missive {
            let body = serde_json::to_string_pretty(missive).unwrap_or_else(|_| missive.to_string());
            if self.pretty {
                writeln!(out, "{} {}", "missive:".cyan(), body)?;
            } else {
                writeln!(out, "missive: {body}")?;
            }
        }
        if !result.figures.is_empty() {
            let line = format!("{} figure(s) captured", result.figures.len());
            if self.pretty {
                writeln!(out, "{}", line.magenta())?;
            } else {
                writeln!(out, "{line}")?;
            }
        }
        if let Some(error) = &result.error {
            if self.pretty {
                writeln!(out, "{}", error.to_string().red().bold())?;
            } else {
                writeln!(out, "{error}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionError;
    use chrono::Utc;
    use serde_json::json;

    fn sample() -> ExecutionResult {
        ExecutionResult {
            filename: "main.py".into(),
            time: 3,
            stdout: "hello".into(),
            stderr: String::new(),
            missive: Some(json!({ "n": 1 })),
            figures: vec!["aGk=".into()],
            error: Some(ExecutionError::new("ValueError", "bad")),
            timestamp: Utc::now(),
            executed_with_namespace: false,
        }
    }

    #[test]
    fn plain_text_lists_every_section() {
        let printer = ResultPrinter { pretty: false, json: false };
        let mut buf = Vec::new();
        printer.write(&mut buf, &sample()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("hello\n"));
        assert!(text.contains("missive: {"));
        assert!(text.contains("1 figure(s) captured"));
        assert!(text.ends_with("ValueError: bad\n"));
    }

    #[test]
    fn json_mode_uses_camel_case() {
        let printer = ResultPrinter { pretty: true, json: true };
        let mut buf = Vec::new();
        printer.write(&mut buf, &sample()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["executedWithNamespace"], json!(false));
        assert_eq!(value["error"]["kind"], "ValueError");
    }
}
