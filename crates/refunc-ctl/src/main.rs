//! refunc-ctl — command-line interface for the refunc gateway.

mod cmd;

use std::time::Duration;

use anyhow::{Context, Result};

use cmd::http::base_url;
use cmd::invoke::{cmd_invoke, InvokeOptions};
use cmd::tasks::{cmd_meta, cmd_tasks};

const DEFAULT_PORT: u16 = 7788;

fn print_usage() {
    println!("Usage: refunc-ctl [options] <command>");
    println!();
    println!("Commands:");
    println!("  invoke <ns/name> [json-args]   Call a function and print its result");
    println!("  meta <ns/name>                 Show function metadata");
    println!("  tasks                          List calls in flight");
    println!();
    println!("Options:");
    println!("  --port <port>      Gateway port on 127.0.0.1 (default: {})", DEFAULT_PORT);
    println!("  --url <url>        Gateway base URL, overrides --port and $REFUNC_ROUTER_BASE");
    println!("  --log              Stream function logs to stderr (invoke)");
    println!("  --user <user>      Caller identity sent with the request (invoke)");
    println!("  --timeout <secs>   Give up after this many seconds (invoke)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut url = std::env::var("REFUNC_ROUTER_BASE").ok().filter(|u| !u.is_empty());
    let mut opts = InvokeOptions {
        recv_log: false,
        user: None,
        timeout: None,
    };
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
                url = None;
            }
            "--url" => {
                i += 1;
                url = Some(args.get(i).context("--url requires a value")?.clone());
            }
            "--log" => opts.recv_log = true,
            "--user" => {
                i += 1;
                opts.user = Some(args.get(i).context("--user requires a value")?.clone());
            }
            "--timeout" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .context("--timeout requires a value")?
                    .parse()
                    .context("--timeout must be a number of seconds")?;
                opts.timeout = Some(Duration::from_secs(secs));
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let base = url.unwrap_or_else(|| base_url(port));

    match remaining.as_slice() {
        ["invoke", endpoint]             => cmd_invoke(&base, endpoint, None, &opts).await,
        ["invoke", endpoint, json]       => cmd_invoke(&base, endpoint, Some(json), &opts).await,
        ["meta", endpoint]               => cmd_meta(&base, endpoint).await,
        ["tasks"] | []                   => cmd_tasks(&base).await,
        ["help"] | ["--help"] | ["-h"]   => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
