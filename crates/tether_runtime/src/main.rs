//! Tether Runtime
//!
//! Runs a script file (or `-e` source) in an engine backed by the reference host,
//! with a `print` function bound as a host object.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::rc::Rc;
use tether_host::{HostBridge, HostFunction, KeepAliveStore};
use tether_script::{EngineConfig, ScriptEngine, WireValue};

const USAGE: &str = "usage: tether [--config FILE] [--json] (-e SOURCE | FILE)";

#[derive(Debug, PartialEq)]
enum Input {
    Source(String),
    File(PathBuf),
}

#[derive(Debug, PartialEq)]
struct Options {
    config: Option<PathBuf>,
    json: bool,
    input: Input,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options> {
    let mut args = args.into_iter();
    let mut config = None;
    let mut json = false;
    let mut input = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a file")?)),
            "--json" => json = true,
            "-e" => input = Some(Input::Source(args.next().context("-e needs source text")?)),
            flag if flag.starts_with('-') => bail!("unknown option {flag}\n{USAGE}"),
            path => {
                if input.is_some() {
                    bail!("more than one script given\n{USAGE}");
                }
                input = Some(Input::File(PathBuf::from(path)));
            }
        }
    }

    Ok(Options {
        config,
        json,
        input: input.context(USAGE)?,
    })
}

/// Text `print` writes for one argument
fn printed(value: &WireValue) -> String {
    match value {
        WireValue::String(s) => s.to_string_lossy(),
        other => other.to_string(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let options = parse_args(std::env::args().skip(1))?;
    tracing::info!("Tether v{}", env!("CARGO_PKG_VERSION"));

    let config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let store = Rc::new(KeepAliveStore::new());
    let engine = ScriptEngine::with_config(HostBridge::new(store.clone()), config)?;

    let print = store.add(Rc::new(HostFunction::new("print", |_cx, args| {
        let line: Vec<String> = args.iter().map(printed).collect();
        println!("{}", line.join(" "));
        Ok(WireValue::Null)
    })));
    engine.set_variable("print", &WireValue::ManagedRef(print));

    let result = match &options.input {
        Input::Source(source) => engine.execute(source),
        Input::File(path) => engine.execute_file(path),
    };

    if options.json {
        println!("{}", serde_json::to_string(&result)?);
    } else if !result.is_null() {
        println!("{result}");
    }

    let stats = engine.stats();
    tracing::debug!(?stats, "engine finished");
    engine.dispose()?;

    if result.is_error() {
        std::process::exit(1);
    }
    Ok(())
}
