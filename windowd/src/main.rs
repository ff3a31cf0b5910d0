#![deny(clippy::as_conversions)]
use opts::Opts;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use windowd::{routing, Parameters, WindowExecutor, WindowManager};
use windowd_api::{CommandlineArgs, PeasantId};

mod opts;

/// Stands in for a real window: prints what it was asked to do
struct PrintingExecutor;

impl WindowExecutor for PrintingExecutor {
    fn execute(&self, id: PeasantId, args: &CommandlineArgs) {
        print_line(&format!("execute id={id} args={args}"));
    }
}

fn print_line(line: &str) {
    let mut stdout = io::stdout().lock();
    // a closed stdout is not our problem
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    // from here on, termination goes through the orderly teardown below
    let term = register_term_signals()?;

    let params = Parameters::builder()
        .runtime_dir(opts.runtime_dir.clone())
        .app_name(opts.app_name.clone())
        .window_name(opts.name.clone());

    let params = if let Some(period) = opts.liveness_poll {
        params.liveness_poll_period(period)
    } else {
        params.liveness_poll_period(Parameters::DEFAULT_LIVENESS_POLL_PERIOD)
    };

    let manager = WindowManager::new(params.build(), Arc::new(PrintingExecutor))?;
    manager
        .find_target_window_requested()
        .subscribe(routing::route_by_window_flag);

    let mut state_rx = manager.subscribe_state();
    print_line(&format!("state={}", *state_rx.borrow_and_update()));

    let args = CommandlineArgs::new(opts.commandline.clone(), std::env::current_dir()?);
    if !manager.propose_commandline(&args)? {
        print_line("delegated");
        return Ok(());
    }

    while !term.load(Ordering::Relaxed) {
        if state_rx.has_changed().unwrap_or(false) {
            print_line(&format!("state={}", *state_rx.borrow_and_update()));
        }
        if let Some(e) = manager.take_fatal_error() {
            return Err(e.into());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Signal received, shutting down");
    drop(manager);

    Ok(())
}

/// Flag raised by SIGTERM & co., instead of them killing the process
fn register_term_signals() -> io::Result<Arc<AtomicBool>> {
    let term = Arc::new(AtomicBool::new(false));
    for signal in signal_hook::consts::TERM_SIGNALS {
        signal_hook::flag::register(*signal, Arc::clone(&term))?;
    }
    Ok(term)
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}

#[test]
fn term_signal_raises_flag() -> anyhow::Result<()> {
    let term = register_term_signals()?;
    assert!(!term.load(Ordering::Relaxed));

    signal_hook::low_level::raise(signal_hook::consts::SIGTERM)?;

    assert!(term.load(Ordering::Relaxed));
    Ok(())
}
