// hashforge-cli: Pool Operator Command Line Interface
//
// Lightweight client that drives the admin HTTP API of a running
// hashforged. The bearer token comes from HASHFORGE_ADMIN_TOKEN (printed by
// the daemon at startup).
// Usage: hashforge-cli <command> [args...]

use std::env;

use colored::*;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn print_usage() {
    println!(
        "{}",
        "                 HASHFORGE: Pool Operator CLI                 "
            .bright_yellow()
            .on_blue()
            .bold()
    );
    println!();
    println!(
        "{}",
        "  Usage: hashforge-cli <command> [args...]".bright_yellow().bold()
    );
    println!();
    println!("{}", "  Commands:".bright_white().bold());
    let commands: &[(&str, &str)] = &[
        ("stats", "Pool aggregate: height, miners, hash rates"),
        ("miners", "List every miner record"),
        ("blockchain", "Full chain snapshot"),
        ("block <index>", "Single block by index"),
        ("validate", "Chain-wide integrity check"),
        ("cpu", "CPU+GPU usage report per miner"),
        ("pause <miner_id>", "Stop a miner's workers at its next heartbeat"),
        ("resume <miner_id>", "Let a paused miner mine again"),
        ("throttle <miner_id> <pct>", "CPU throttle 0-100"),
        ("delete <miner_id>", "Evict a miner from the pool"),
    ];
    for (cmd, help) in commands {
        println!(
            "  {} {:<28} {}",
            "❯".bright_black(),
            cmd.bright_green(),
            help.white()
        );
    }
    println!();
    println!(
        "  {} set {} and {} to reach a non-default daemon",
        "env:".bright_black(),
        "HASHFORGE_ADMIN_TOKEN".bright_yellow(),
        "HASHFORGE_HTTP_PORT".bright_yellow()
    );
    println!();
}

/// Command → (method, path, body).
fn route(args: &[String]) -> Option<(&'static str, String, Option<Value>)> {
    let cmd = args[0].as_str();
    match cmd {
        "stats" => Some(("GET", "/api/stats".to_string(), None)),
        "miners" => Some(("GET", "/api/miners".to_string(), None)),
        "blockchain" => Some(("GET", "/api/blockchain".to_string(), None)),
        "validate" => Some(("GET", "/api/validate".to_string(), None)),
        "cpu" => Some(("GET", "/api/cpu".to_string(), None)),
        "block" => {
            let index = args.get(1)?;
            Some(("GET", format!("/api/blocks/{index}"), None))
        }
        "pause" | "resume" | "delete" => {
            let id = args.get(1)?;
            Some((
                "POST",
                format!("/api/miner/{cmd}"),
                Some(json!({ "miner_id": id })),
            ))
        }
        "throttle" => {
            let id = args.get(1)?;
            let pct: u8 = args.get(2)?.parse().ok()?;
            Some((
                "POST",
                "/api/miner/throttle".to_string(),
                Some(json!({ "miner_id": id, "throttle_percent": pct })),
            ))
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return Ok(());
    }

    let Some((method, path, body)) = route(&args) else {
        print_usage();
        std::process::exit(2);
    };

    let token = env::var("HASHFORGE_ADMIN_TOKEN").unwrap_or_default();
    if token.is_empty() {
        eprintln!(
            "{} HASHFORGE_ADMIN_TOKEN is not set: copy it from the daemon startup output",
            "error:".bright_red().bold()
        );
        std::process::exit(1);
    }

    let addr = format!(
        "{}:{}",
        hashforge::config::HTTP_BIND_ADDRESS,
        hashforge::config::http_port()
    );
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(_) => {
            eprintln!(
                "{} cannot connect to hashforged at {}",
                "error:".bright_red().bold(),
                addr
            );
            eprintln!(
                "Is the daemon running? Start it with: {}",
                "hashforged".bright_yellow().bold()
            );
            std::process::exit(1);
        }
    };

    let body_bytes = body.map(|b| serde_json::to_vec(&b)).transpose()?.unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nAuthorization: Bearer {token}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body_bytes.len(),
    );
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(&body_bytes).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response_str = String::from_utf8_lossy(&response);

    // Parse out the JSON body from the HTTP response
    let Some(body_start) = response_str.find("\r\n\r\n") else {
        eprintln!("{} malformed response", "error:".bright_red().bold());
        std::process::exit(1);
    };
    let status: u16 = response_str
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let json_body = &response_str[body_start + 4..];

    match serde_json::from_str::<Value>(json_body) {
        Ok(parsed) => {
            if let Some(err) = parsed.get("error") {
                eprintln!(
                    "{} {}",
                    "Error:".bright_red().bold(),
                    err.as_str().unwrap_or("unknown")
                );
                std::process::exit(1);
            }
            println!("{}", serde_json::to_string_pretty(&parsed)?.bright_white());
        }
        Err(_) => {
            eprintln!(
                "{} HTTP {} with non-JSON body",
                "error:".bright_red().bold(),
                status
            );
            std::process::exit(1);
        }
    }
    Ok(())
}
