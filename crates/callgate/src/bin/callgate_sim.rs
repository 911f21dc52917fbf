use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use callgate::{
    CallError, CallOutcome, CallRequest, Dispatcher, DispatcherConfig, DispatcherSnapshot,
};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug)]
struct Args {
    calls: usize,
    hosts: usize,
    latency: Duration,
    fail_every: Option<usize>,
    duplex_every: Option<usize>,
    max_requests: Option<usize>,
    max_requests_per_host: Option<usize>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            calls: 100,
            hosts: 4,
            latency: Duration::from_millis(20),
            fail_every: None,
            duplex_every: None,
            max_requests: None,
            max_requests_per_host: None,
        }
    }
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Serialize)]
struct Outcomes {
    succeeded: usize,
    failed: usize,
    canceled: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    config: DispatcherConfig,
    calls: usize,
    outcomes: Outcomes,
    peak_running: usize,
    peak_running_per_host: BTreeMap<String, usize>,
    elapsed_ms: u64,
    final_state: DispatcherSnapshot,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: callgate-sim [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --calls <n>          Calls to submit [default: 100]");
            eprintln!("  --hosts <n>          Distinct hosts [default: 4]");
            eprintln!("  --latency-ms <n>     Base call latency [default: 20]");
            eprintln!("  --fail-every <n>     Fail every n-th call");
            eprintln!("  --duplex-every <n>   Mark every n-th call as duplex");
            eprintln!("  --max-requests <n>   Global limit [env: CALLGATE_MAX_REQUESTS]");
            eprintln!(
                "  --max-per-host <n>   Per-host limit [env: CALLGATE_MAX_REQUESTS_PER_HOST]"
            );
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    fn value(args: &[String], i: usize, flag: &str) -> Result<usize, String> {
        let raw = args.get(i).ok_or(format!("{flag} requires a value"))?;
        raw.parse::<usize>()
            .map_err(|e| format!("{flag}: invalid value {raw:?}: {e}"))
    }

    let mut parsed = Args::default();
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--calls" => {
                i += 1;
                parsed.calls = value(args, i, flag)?;
            }
            "--hosts" => {
                i += 1;
                parsed.hosts = value(args, i, flag)?.max(1);
            }
            "--latency-ms" => {
                i += 1;
                parsed.latency = Duration::from_millis(value(args, i, flag)? as u64);
            }
            "--fail-every" => {
                i += 1;
                parsed.fail_every = Some(value(args, i, flag)?).filter(|n| *n > 0);
            }
            "--duplex-every" => {
                i += 1;
                parsed.duplex_every = Some(value(args, i, flag)?).filter(|n| *n > 0);
            }
            "--max-requests" => {
                i += 1;
                parsed.max_requests = Some(value(args, i, flag)?);
            }
            "--max-per-host" => {
                i += 1;
                parsed.max_requests_per_host = Some(value(args, i, flag)?);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

/// Initialize tracing with CALLGATE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CALLGATE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("callgate={level},callgate_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = DispatcherConfig::from_env().context("reading limits from environment")?;
    if let Some(max) = args.max_requests {
        config = config.with_max_requests(max);
    }
    if let Some(max) = args.max_requests_per_host {
        config = config.with_max_requests_per_host(max);
    }

    let dispatcher = Dispatcher::with_tokio(config).context("creating dispatcher")?;

    let idle = Arc::new(tokio::sync::Notify::new());
    let idle_cb = Arc::clone(&idle);
    dispatcher.set_idle_callback(Some(Arc::new(move || idle_cb.notify_one())));

    let global = Arc::new(Gauge::default());
    let per_host: BTreeMap<String, Arc<Gauge>> = (0..args.hosts)
        .map(|h| (format!("host-{h}.example"), Arc::new(Gauge::default())))
        .collect();
    let host_names: Vec<String> = per_host.keys().cloned().collect();

    tracing::info!(
        calls = args.calls,
        hosts = args.hosts,
        max_requests = config.max_requests,
        max_requests_per_host = config.max_requests_per_host,
        "Starting simulation"
    );

    let started = Instant::now();
    let mut calls = Vec::with_capacity(args.calls);
    for n in 0..args.calls {
        let host = host_names[n % host_names.len()].clone();
        let duplex = args.duplex_every.is_some_and(|every| n % every == every - 1);
        let fail = args.fail_every.is_some_and(|every| n % every == every - 1);
        let latency = args.latency * (1 + (n % 3) as u32);

        let global = Arc::clone(&global);
        let host_gauge = (!duplex).then(|| Arc::clone(&per_host[&host]));

        let request = CallRequest::new(host, move |_| async move {
            global.enter();
            if let Some(g) = &host_gauge {
                g.enter();
            }
            tokio::time::sleep(latency).await;
            if let Some(g) = &host_gauge {
                g.exit();
            }
            global.exit();

            if fail {
                Err(CallError::Failed(format!("simulated failure for call {n}")))
            } else {
                Ok(())
            }
        })
        .duplex(duplex);

        calls.push(dispatcher.submit(request));
    }

    tracing::info!(snapshot = ?dispatcher.snapshot(), "All calls submitted");

    if !calls.is_empty() {
        idle.notified().await;
    }

    let mut outcomes = Outcomes::default();
    for call in &calls {
        match call.wait().await {
            CallOutcome::Succeeded => outcomes.succeeded += 1,
            CallOutcome::Failed(_) => outcomes.failed += 1,
            CallOutcome::Canceled => outcomes.canceled += 1,
        }
    }

    let report = Report {
        config,
        calls: calls.len(),
        outcomes,
        peak_running: global.peak(),
        peak_running_per_host: per_host
            .iter()
            .map(|(host, gauge)| (host.clone(), gauge.peak()))
            .collect(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        final_state: dispatcher.snapshot(),
    };

    let json = serde_json::to_string_pretty(&report).context("serializing report")?;
    println!("{json}");

    if report.peak_running > config.max_requests {
        anyhow::bail!(
            "global limit exceeded: {} > {}",
            report.peak_running,
            config.max_requests
        );
    }
    if let Some((host, peak)) = report
        .peak_running_per_host
        .iter()
        .find(|(_, peak)| **peak > config.max_requests_per_host)
    {
        anyhow::bail!(
            "per-host limit exceeded for {host}: {peak} > {}",
            config.max_requests_per_host
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("callgate-sim")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_defaults() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args.calls, 100);
        assert_eq!(args.hosts, 4);
        assert!(args.max_requests.is_none());
    }

    #[test]
    fn parses_flags() {
        let args = parse_args(&argv(&[
            "--calls",
            "7",
            "--max-per-host",
            "1",
            "--fail-every",
            "0",
            "--latency-ms",
            "5",
        ]))
        .unwrap();
        assert_eq!(args.calls, 7);
        assert_eq!(args.max_requests_per_host, Some(1));
        assert_eq!(args.fail_every, None);
        assert_eq!(args.latency, Duration::from_millis(5));
    }

    #[test]
    fn rejects_unknown_and_missing() {
        assert!(parse_args(&argv(&["--bogus"])).is_err());
        assert!(parse_args(&argv(&["--calls"])).is_err());
        assert!(parse_args(&argv(&["--calls", "many"])).is_err());
    }

    #[tokio::test]
    async fn simulation_respects_limits() {
        let args = Args {
            calls: 20,
            hosts: 2,
            latency: Duration::from_millis(1),
            fail_every: Some(5),
            duplex_every: None,
            max_requests: Some(3),
            max_requests_per_host: Some(1),
        };
        run(args).await.unwrap();
    }
}
