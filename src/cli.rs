use clap::{ArgGroup, Parser};

#[derive(Parser, Debug, Clone)]
#[command(name = "nagini", about = "Run Python code in an isolated execution context", version)]
#[command(group(ArgGroup::new("source").args(["file", "code"]).multiple(false)))]
#[command(group(ArgGroup::new("pretty_switch").args(["pretty", "no_pretty"]).multiple(false)))]
pub struct Cli {
    /// Python file to run. Reads stdin when neither FILE nor --code is given.
    #[arg(value_name = "FILE")]
    pub file: Option<String>,

    /// Code to run instead of a file.
    #[arg(short = 'c', long = "code")]
    pub code: Option<String>,

    /// Answer the next input() call with this value.
    /// Can be used multiple times; values are consumed in order.
    #[arg(long = "input", action = clap::ArgAction::Append)]
    pub input: Vec<String>,

    /// JSON object whose keys are bound as globals for this run only.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Package to import before running. Can be repeated.
    #[arg(short = 'p', long = "package", action = clap::ArgAction::Append)]
    pub package: Vec<String>,

    /// Package to install with pip before running. Can be repeated.
    #[arg(long = "install", action = clap::ArgAction::Append)]
    pub install: Vec<String>,

    /// Preload a file as PATH=SOURCE, where SOURCE is a local path or an http(s) URL.
    #[arg(long = "load", value_name = "PATH=SOURCE", action = clap::ArgAction::Append)]
    pub load: Vec<String>,

    /// Print the execution result as JSON.
    #[arg(long)]
    pub json: bool,

    /// Colour stderr and errors.
    #[arg(long)]
    pub pretty: bool,
    /// Disable colouring.
    #[arg(long = "no-pretty")]
    pub no_pretty: bool,

    /// Never prompt on the terminal for input; unanswered requests get an empty string.
    #[arg(long = "no-interaction")]
    pub no_interaction: bool,

    /// Python interpreter to use (overrides PYTHON_BIN).
    #[arg(long)]
    pub python: Option<String>,

    /// Execution timeout in milliseconds (overrides EXECUTION_TIMEOUT_MS).
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
