#![forbid(unsafe_code)]

//! Lobby load test - spawn populations of simulated clients against a lobby server
//!
//! Usage:
//!   cargo run -- --host lobby.example.com --port 8001 --clients 1000
//!   cargo run -- --clients 50 --pacing brute-force --duration 60
//!   cargo run -- --clients 200 --pacing fixed

use anyhow::Result;
use lobby_loadtest::config::LoadTestConfig;
use lobby_loadtest::db;
use lobby_loadtest::runner::LoadTestRunner;
use lobby_loadtest::stats::StatsSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lobby_loadtest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = LoadTestConfig::from_env();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-s" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().unwrap_or(config.port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--clients" | "-c" => {
                if i + 1 < args.len() {
                    config.clients = args[i + 1].parse().unwrap_or(config.clients);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--duration" | "-d" => {
                if i + 1 < args.len() {
                    config.duration_secs = args[i + 1].parse().unwrap_or(config.duration_secs);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--pacing" | "-p" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(pacing) => config.pacing = pacing,
                        Err(e) => eprintln!("{e}, keeping {}", config.pacing),
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    info!(
        "Targeting {}:{} with {} clients, {} pacing, {}s run",
        config.host, config.port, config.clients, config.pacing, config.duration_secs
    );

    let db_pool = db::connect().await?;

    let config = Arc::new(config);
    let runner = LoadTestRunner::new(Arc::clone(&config), db_pool);
    runner.set_target_population(config.clients)?;
    runner.start(&config.host, config.port, config.pacing)?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let s = runner.snapshot();
                info!(
                    "{} clients | {} games | sent {} ({}/s) | received {} ({}/s)",
                    s.live_sessions(),
                    s.created_games,
                    s.sent_messages,
                    s.outgoing_rate,
                    s.received_messages,
                    s.incoming_rate,
                );
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!("Run duration reached, shutting down...");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    let final_snapshot = runner.snapshot();
    runner.stop().await?;
    print_summary(&final_snapshot);

    Ok(())
}

fn print_summary(snapshot: &StatsSnapshot) {
    println!("\n=== Load Test Summary ===");
    println!("Elapsed: {:.1}s", snapshot.elapsed.as_secs_f64());
    println!("Games Created: {}", snapshot.created_games);
    println!("Messages Sent: {}", snapshot.sent_messages);
    println!("Messages Received: {}", snapshot.received_messages);
    println!("Client States:");
    for (state, count) in &snapshot.session_states {
        if *count > 0 {
            println!("  {state:?}: {count}");
        }
    }
    println!("========================\n");
}

fn print_usage() {
    println!("Lobby load test");
    println!("\nUsage:");
    println!("  cargo run [OPTIONS]");
    println!("\nOptions:");
    println!("  -s, --host <HOST>        Lobby server host (default: localhost)");
    println!("      --port <PORT>        Lobby server port (default: 8001)");
    println!("  -c, --clients <N>        Number of simulated clients (default: 1000)");
    println!("  -d, --duration <SECS>    Run duration in seconds (default: 360)");
    println!("  -p, --pacing <POLICY>    Think-time policy: human, fixed, brute-force");
    println!("                           (default: human)");
    println!("  -h, --help               Print this help message");
    println!("\nEnvironment Variables:");
    println!("  LOADTEST_HOST, LOADTEST_PORT, LOADTEST_CLIENTS,");
    println!("  LOADTEST_DURATION_SECS, LOADTEST_PACING");
    println!("                           Same settings as the flags above");
    println!("  DATABASE_URL             Optional Postgres URL; when set, simulated");
    println!("                           user credentials are upserted before a run");
    println!("  RUST_LOG                 Log filter (default: lobby_loadtest=info)");
}
