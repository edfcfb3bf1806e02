//! Command execution.

use crate::Commands;
use colored::Colorize;
use qwire_client::{Client, Endpoint, Event};
use serde_json::{json, Value};

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Query { code, vars } => {
            let result: Value = match vars {
                Some(vars) => {
                    let vars = parse_json_arg(&vars)?;
                    if !vars.is_object() {
                        return Err("--vars must be a JSON object".into());
                    }
                    client.query_with(&code, &vars).await?
                }
                None => client.query(&code).await?,
            };
            Ok(format_json(&result))
        }

        Commands::Run { procedure, args } => {
            let args = args
                .iter()
                .map(|arg| parse_json_arg(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let result: Value = client.run(&procedure, args.as_slice()).await?;
            Ok(format_json(&result))
        }

        // Watch streams events and is handled directly in main.rs
        Commands::Watch { .. } => unreachable!(),
    }
}

/// Splits a `--pipe` command line into program and arguments.
pub fn parse_pipe(command: &str) -> Result<Endpoint, Box<dyn std::error::Error>> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or("--pipe needs a command")?;
    Ok(Endpoint::pipe(program, parts))
}

/// One line of JSON per event.
pub fn format_event(event: &Event) -> String {
    let data = event
        .decode::<Value>()
        .unwrap_or_else(|_| json!({ "raw_len": event.payload.len() }));
    json!({
        "event": format!("{:?}", event.kind),
        "data": data,
    })
    .to_string()
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
