use anyhow::{Context, Result};
use clap::Parser;
use fntrace::agent::Agent;
use fntrace::backend::BackendPreference;
use fntrace::cli::Cli;
use fntrace::config::TracerConfig;
use fntrace::control::ControlSurface;
use fntrace::hook::InstrumentationHook;
use fntrace::protocol::stats_payload;
use fntrace::runtime::Runtime;
use fntrace::transport::{LocalAttachment, LocalEvaluator, LocalTransport, ThreadedTransport};
use fntrace::workload::{self, Workload};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const REFRESH_INTERVAL: Duration = Duration::from_millis(20);

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> Result<TracerConfig> {
    let mut config = match &args.config {
        Some(path) => TracerConfig::from_toml(path)?,
        None => TracerConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    Ok(config)
}

fn attach(agent: &Arc<Agent>, config: &TracerConfig, threaded: bool) -> Result<LocalAttachment> {
    let attachment = LocalAttachment::detached();
    if config.backend != BackendPreference::Injection {
        if threaded {
            let transport = ThreadedTransport::spawn(Arc::clone(agent), config.worker_queue_capacity)
                .context("Failed to start agent thread")?;
            attachment.attach_transport(Arc::new(transport));
        } else {
            attachment.attach_transport(Arc::new(LocalTransport::new(Arc::clone(agent))));
        }
    }
    if config.backend != BackendPreference::Protocol {
        attachment.attach_evaluator(Arc::new(LocalEvaluator::new(Arc::clone(agent))));
    }
    Ok(attachment)
}

/// Block until the start confirmation has been processed
fn wait_until_active(control: &ControlSurface, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !control.is_tracing_active() {
        if Instant::now() >= deadline {
            anyhow::bail!("Tracer did not confirm start within {:?}", timeout);
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let functions = if !args.functions.is_empty() {
        args.functions.clone()
    } else if !config.functions.is_empty() {
        config.functions.clone()
    } else {
        Workload::function_names()
    };

    let runtime = Arc::new(Runtime::new());
    let workload = Workload::register(Arc::clone(&runtime));
    let agent = Arc::new(Agent::new(Arc::new(InstrumentationHook::new(runtime))));

    let attachment = attach(&agent, &config, args.threaded_transport)?;
    let control = ControlSurface::with_config(Arc::new(attachment), &config);

    if !control.start_tracing(functions) {
        anyhow::bail!("Failed to start tracing (backend: {:?})", config.backend);
    }
    wait_until_active(&control, config.request_timeout())?;

    workload::quiet_flaky_panics();
    let (calls, depth) = (args.calls, args.depth);
    let workload = &workload;
    let digest = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.threads.max(1))
            .map(|_| scope.spawn(move || workload.run(calls, depth)))
            .collect();

        while !workers.iter().all(|w| w.is_finished()) {
            control.refresh_results();
            thread::sleep(REFRESH_INTERVAL);
        }

        workers
            .into_iter()
            .filter_map(|w| w.join().ok())
            .fold(0u64, u64::wrapping_add)
    });
    tracing::debug!(digest, "workload finished");

    let stats = control
        .stop_tracing_wait()
        .context("Failed to collect final stats")?;
    println!("{}", serde_json::to_string_pretty(&stats_payload(&stats))?);

    Ok(())
}
