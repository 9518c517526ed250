mod cli;

use std::io::{self, BufRead, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use is_terminal::IsTerminal;
use nagini::config::Config;
use nagini::printer::ResultPrinter;
use nagini::{Controller, ControllerConfig, FileToLoad, InitOptions, Namespace, PythonRuntime};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = cli::Cli::parse();

    let mut cfg = Config::load();
    if let Some(python) = &args.python {
        cfg.set("PYTHON_BIN", python.clone());
    }
    if let Some(ms) = args.timeout_ms {
        cfg.set("EXECUTION_TIMEOUT_MS", ms.to_string());
    }

    // Code piped on stdin leaves no terminal to answer input requests from.
    let stdin_is_tty = io::stdin().is_terminal();
    let (filename, code, stdin_free) = match (&args.file, &args.code) {
        (Some(path), _) => {
            let code = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            (name, code, true)
        }
        (None, Some(code)) => ("<string>".to_string(), code.clone(), true),
        (None, None) => {
            if stdin_is_tty {
                bail!("nothing to run: pass FILE, --code, or pipe code on stdin");
            }
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            ("<stdin>".to_string(), buf, false)
        }
    };

    let namespace = args.namespace.as_deref().map(parse_namespace).transpose()?;

    let mut options = InitOptions::new();
    for package in cfg.get_list("DEFAULT_PACKAGES").into_iter().chain(args.package.iter().cloned()) {
        options = options.package(package);
    }
    for package in &args.install {
        options = options.extra_package(package.clone());
    }
    for entry in &args.load {
        options = options.file(parse_load(entry)?);
    }

    let runtime = PythonRuntime::from_config(&cfg)?;
    let controller = Controller::start(runtime, options, ControllerConfig::from_config(&cfg))
        .await
        .context("failed to start execution context")?;

    for value in &args.input {
        controller.queue_input(value.clone());
    }
    if !args.no_interaction && stdin_is_tty && stdin_free {
        controller.set_input_callback(|request| {
            let prompt = request.prompt.clone();
            let responder = request.into_responder();
            tokio::task::spawn_blocking(move || {
                eprint!("{prompt}");
                let _ = io::stderr().flush();
                let mut line = String::new();
                if let Err(err) = io::stdin().lock().read_line(&mut line) {
                    tracing::warn!(error = %err, "failed to read input from terminal");
                }
                let value = line.trim_end_matches(['\r', '\n']).to_string();
                if let Err(err) = responder.respond(value) {
                    tracing::warn!(error = %err, "failed to send input");
                }
            });
        });
    }

    let outcome = controller.execute_async(&filename, &code, namespace).await;
    controller.destroy().await;
    let result = outcome?;

    let pretty = if args.no_pretty {
        false
    } else if args.pretty {
        true
    } else {
        cfg.get_bool("PRETTIFY_OUTPUT") && io::stdout().is_terminal()
    };
    ResultPrinter { pretty, json: args.json }.print(&result)?;

    if !result.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_namespace(raw: &str) -> Result<Namespace> {
    match serde_json::from_str::<Value>(raw).context("--namespace is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--namespace must be a JSON object"),
    }
}

/// `PATH=SOURCE`: URLs are fetched by the execution context, local files are
/// read here and sent inline.
fn parse_load(entry: &str) -> Result<FileToLoad> {
    let Some((path, source)) = entry.split_once('=') else {
        bail!("--load expects PATH=SOURCE, got {entry:?}");
    };
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(FileToLoad::remote(path, source));
    }
    let content = std::fs::read_to_string(source).with_context(|| format!("failed to read {source}"))?;
    Ok(FileToLoad::inline(path, content))
}
