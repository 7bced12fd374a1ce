use std::sync::Arc;
use std::time::Duration;

use hashforge::config;
use hashforge::net::server::start_pool_server;
use hashforge::pool::MiningPool;
use hashforge::rpc::server::start_admin_server;

use colored::*;

fn banner() {
    println!(
        "{}",
        " ██╗  ██╗ █████╗ ███████╗██╗  ██╗███████╗ ██████╗ ██████╗  ██████╗ ███████╗".bright_cyan()
    );
    println!(
        "{}",
        " ██║  ██║██╔══██╗██╔════╝██║  ██║██╔════╝██╔═══██╗██╔══██╗██╔════╝ ██╔════╝".bright_cyan()
    );
    println!(
        "{}",
        " ███████║███████║███████╗███████║█████╗  ██║   ██║██████╔╝██║  ███╗█████╗  "
            .bright_cyan()
            .bold()
    );
    println!(
        "{}",
        " ██╔══██║██╔══██║╚════██║██╔══██║██╔══╝  ██║   ██║██╔══██╗██║   ██║██╔══╝  "
            .bright_cyan()
            .bold()
    );
    println!(
        "{}",
        " ██║  ██║██║  ██║███████║██║  ██║██║     ╚██████╔╝██║  ██║╚██████╔╝███████╗".blue()
    );
    println!(
        "{}",
        " ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚═╝  ╚═╝╚═╝      ╚═════╝ ╚═╝  ╚═╝ ╚═════╝ ╚══════╝".blue()
    );
    println!();
    println!(
        "{}",
        "            SHA-256 Mining Pool Coordinator            "
            .bright_green()
            .bold()
    );
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    banner();

    let difficulty = config::difficulty();
    let reward = config::block_reward();
    let pool_port = config::pool_port();
    let http_port = config::http_port();

    let env_token = config::admin_token();
    let generated = env_token.is_none();
    let pool = Arc::new(MiningPool::new(difficulty, reward, env_token));

    println!(
        "{} difficulty {} (leading hex zeros), block reward {}",
        "[init]".bright_blue().bold(),
        difficulty,
        reward
    );
    println!(
        "{} chain height: {} (in-memory, process lifetime only)",
        "[init]".bright_blue().bold(),
        pool.height()
    );
    if generated {
        println!(
            "{} admin token: {}",
            "[security]".bright_yellow().bold(),
            pool.admin_token()
        );
        println!(
            "{}",
            "           shown once: set HASHFORGE_ADMIN_TOKEN to pin it".yellow()
        );
    } else {
        println!(
            "{} admin token taken from HASHFORGE_ADMIN_TOKEN",
            "[security]".bright_yellow().bold()
        );
    }

    // Background tick: age out the cached work template so an idle pool
    // still hands out fresh timestamps.
    let tick_pool = pool.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config::TEMPLATE_REFRESH_TICK_SECS));
        loop {
            ticker.tick().await;
            if tick_pool.refresh_stale_template() {
                println!(
                    "{} work template refreshed at height {}",
                    "[pool]".bright_green().bold(),
                    tick_pool.height()
                );
            }
        }
    });

    let http_pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = start_admin_server(http_pool, http_port).await {
            eprintln!("{} error: {e}", "[http]".bright_red().bold());
        }
    });
    println!(
        "{} admin API listening on {}:{}",
        "[http]".bright_magenta().bold(),
        config::HTTP_BIND_ADDRESS,
        http_port
    );

    start_pool_server(pool, pool_port).await?;
    println!("{} done", "[shutdown]".bright_red().bold());
    Ok(())
}
