//! Mock CLI binary for integration testing
//!
//! Stands in for the CLI under test. Subcommands:
//!
//! - `echo <json>`: print the document
//! - `cat <file>`: print a file relative to the working directory
//! - `get <resource>`: print `$MOCK_CLI_STATE/<resource>.json`, or `[]`
//! - `put <resource> <file>`: store a JSON/YAML file as the resource
//! - `fail <code> <message>`: print the message on stderr and exit
//! - `flaky <counter> <n> <json>`: fail with "connection refused" for the
//!   first `n` calls (tracked in the counter file), then echo
//! - `env <NAME>`: print `{"name": NAME, "value": $NAME}`
//!
//! `--profile <p>` is accepted and ignored; `-o/--output json|yaml|text`
//! selects the output format. Every argument vector is appended to
//! `$MOCK_CLI_LOG` when set.

use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;

fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    log_invocation(&raw);

    let (args, output) = split_flags(&raw);
    let Some(verb) = args.first() else {
        die(64, "usage: mock_cli <verb> [args...]");
    };

    let doc = match (verb.as_str(), &args[1..]) {
        ("echo", [text]) => parse_doc(text),
        ("cat", [file]) => match fs::read_to_string(file) {
            Ok(text) => {
                print!("{}", text);
                return;
            }
            Err(e) => die(1, &format!("cat {}: {}", file, e)),
        },
        ("get", [resource]) => read_state(resource),
        ("put", [resource, file]) => {
            let text = fs::read_to_string(file)
                .unwrap_or_else(|e| die(1, &format!("put {}: {}", file, e)));
            let doc = serde_yaml::from_str::<Value>(&text)
                .unwrap_or_else(|e| die(1, &format!("put {}: {}", file, e)));
            write_state(resource, &doc);
            json!({ "stored": resource })
        }
        ("fail", [code, message]) => die(code.parse().unwrap_or(1), message),
        ("flaky", [counter, n, text]) => {
            let counter = PathBuf::from(counter);
            let seen: u32 = fs::read_to_string(&counter)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            let _ = fs::write(&counter, (seen + 1).to_string());
            if seen < n.parse().unwrap_or(0) {
                die(1, "dial tcp 127.0.0.1:443: connection refused");
            }
            parse_doc(text)
        }
        ("env", [name]) => json!({
            "name": name,
            "value": std::env::var(name).unwrap_or_default(),
        }),
        _ => die(64, &format!("unknown command: {}", args.join(" "))),
    };

    print_doc(&doc, output.as_deref());
}

/// Remove `--profile`/`-o` style flags, returning the rest and the format
fn split_flags(raw: &[String]) -> (Vec<String>, Option<String>) {
    let mut args = Vec::new();
    let mut output = None;
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--profile" => {
                iter.next();
            }
            "-o" | "--output" => output = iter.next().cloned(),
            other if other.starts_with("--output=") => {
                output = Some(other["--output=".len()..].to_string())
            }
            other if other.starts_with("--profile=") => {}
            _ => args.push(arg.clone()),
        }
    }
    (args, output)
}

fn parse_doc(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|e| die(1, &format!("invalid json: {}", e)))
}

fn print_doc(doc: &Value, output: Option<&str>) {
    let text = match output {
        Some("yaml") => serde_yaml::to_string(doc).unwrap_or_default(),
        Some("text") => format!("{}\n", doc),
        _ => format!("{}\n", serde_json::to_string_pretty(doc).unwrap_or_default()),
    };
    print!("{}", text);
}

fn state_path(resource: &str) -> Option<PathBuf> {
    std::env::var("MOCK_CLI_STATE")
        .ok()
        .map(|dir| PathBuf::from(dir).join(format!("{}.json", resource)))
}

fn read_state(resource: &str) -> Value {
    state_path(resource)
        .and_then(|p| fs::read_to_string(p).ok())
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!([]))
}

fn write_state(resource: &str, doc: &Value) {
    let Some(path) = state_path(resource) else {
        die(1, "MOCK_CLI_STATE is not set");
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(e) = fs::write(&path, doc.to_string()) {
        die(1, &format!("write {}: {}", path.display(), e));
    }
}

fn log_invocation(args: &[String]) {
    let Ok(log) = std::env::var("MOCK_CLI_LOG") else {
        return;
    };
    if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(log) {
        let _ = writeln!(file, "{}", args.join(" "));
    }
}

fn die(code: i32, message: &str) -> ! {
    eprintln!("{}", message);
    exit(code)
}
