//! nl2sql-dispatch-demo: drives the dispatch engine against simulated providers
//!
//! Usage:
//!   nl2sql-dispatch-demo single <query>        One request through the full admission path
//!   nl2sql-dispatch-demo batch [count]         A batch of requests sharing the worker pool
//!   nl2sql-dispatch-demo stream <query>        Streaming delivery printed as JSON lines
//!   nl2sql-dispatch-demo outage                Primary outage served by the fallback tier

use anyhow::Context;
use nl2sql_runtime::providers::{ErrorClass, SimulatedProvider, SimulatedStep};
use nl2sql_runtime::streaming::{channel_sink, OverflowPolicy};
use nl2sql_runtime::telemetry::init_tracing;
use nl2sql_runtime::{DispatchConfig, QueryRequest, QueryService};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "single" => cmd_single(&args[2..]).await,
        "batch" => cmd_batch(&args[2..]).await,
        "stream" => cmd_stream(&args[2..]).await,
        "outage" => cmd_outage().await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"nl2sql-dispatch-demo: dispatch engine walkthrough

USAGE:
    nl2sql-dispatch-demo <COMMAND> [ARGS]

COMMANDS:
    single <query>      Run one request and print the response
    batch [count]       Run `count` requests (default 8) as one batch
    stream <query>      Stream one request as JSON event lines
    outage              Fail the primary and watch degraded responses
    help                Show this help message

ENVIRONMENT:
    NL2SQL_WORKERS, NL2SQL_RPS, NL2SQL_BREAKER_FAILURE_THRESHOLD, ...
    RUST_LOG            Log filter (default: info)"#
    );
}

fn service(primary: SimulatedProvider) -> anyhow::Result<QueryService> {
    QueryService::builder()
        .config(DispatchConfig::from_env())
        .primary(Arc::new(primary))
        .fallback(Arc::new(
            SimulatedProvider::new("fallback-model")
                .with_latency(Duration::from_millis(40))
                .with_default_sql("SELECT COUNT(*) FROM users"),
        ))
        .local(Arc::new(
            SimulatedProvider::new("local-template").with_default_sql("SELECT 1"),
        ))
        .build()
        .context("building query service")
}

fn query_arg(args: &[String]) -> String {
    if args.is_empty() {
        "how many users signed up this week".to_string()
    } else {
        args.join(" ")
    }
}

async fn cmd_single(args: &[String]) -> anyhow::Result<()> {
    let svc = service(
        SimulatedProvider::new("primary-model")
            .with_latency(Duration::from_millis(80))
            .with_default_sql("SELECT COUNT(*) FROM users WHERE created_at > now() - interval '7 days'"),
    )?;
    let resp = svc.process(QueryRequest::new(query_arg(args))).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    println!("{}", serde_json::to_string_pretty(&svc.metrics())?);
    Ok(())
}

async fn cmd_batch(args: &[String]) -> anyhow::Result<()> {
    let count: usize = match args.first() {
        Some(s) => s.parse().context("batch count must be a number")?,
        None => 8,
    };
    let svc = service(SimulatedProvider::new("primary-model").with_latency(Duration::from_millis(50)))?;
    let requests = (0..count)
        .map(|i| QueryRequest::new(format!("report number {i}")))
        .collect();
    let report = svc.process_batch(requests).await?;
    println!(
        "{} of {} succeeded in {} ms",
        report.success_count(),
        report.len(),
        report.execution_time.as_millis()
    );
    for (i, err) in report.failures() {
        println!("  item {i}: {err}");
    }
    let m = svc.metrics();
    println!(
        "workers={} peak_active={} processed={}",
        m.worker_count, m.peak_active_workers, m.processed_jobs
    );
    Ok(())
}

async fn cmd_stream(args: &[String]) -> anyhow::Result<()> {
    let mut cfg = DispatchConfig::from_env();
    cfg.streaming.heartbeat_interval = Duration::from_millis(100);
    cfg.streaming.chunk_size = 16;
    let svc = QueryService::builder()
        .config(cfg)
        .primary(Arc::new(
            SimulatedProvider::new("primary-model")
                .with_latency(Duration::from_millis(350))
                .with_default_sql("SELECT name, email FROM users ORDER BY created_at DESC LIMIT 10"),
        ))
        .build()
        .context("building query service")?;

    let (sink, mut rx) = channel_sink(64, OverflowPolicy::Block);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.to_json() {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("unprintable event: {e}"),
            }
        }
    });

    let outcome = svc
        .process_streaming(QueryRequest::new(query_arg(args)), Box::new(sink))
        .await;
    printer.await.context("event printer panicked")?;
    outcome?;
    Ok(())
}

async fn cmd_outage() -> anyhow::Result<()> {
    let primary = SimulatedProvider::new("primary-model").with_script(
        std::iter::repeat_with(|| {
            SimulatedStep::Fail(ErrorClass::Unavailable, "503 service unavailable".into())
        })
        .take(64),
    );
    let svc = service(primary)?;

    for i in 0..3 {
        let resp = svc
            .process(QueryRequest::new(format!("outage query {i}")).without_cache())
            .await?;
        println!(
            "request {i}: served by {} ({}), degraded: {:?}",
            resp.served_by.provider, resp.served_by.tier, resp.served_by.degraded_reason
        );
    }

    // Fallback answers count as successes, so the breaker stays closed.
    let status = svc.circuit_breaker_status();
    let m = svc.metrics();
    println!(
        "breaker: {} ({} failures), degraded responses: {}",
        status.state.as_str(),
        status.failure_count,
        m.degraded_responses
    );
    Ok(())
}
