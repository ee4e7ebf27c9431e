//! Demonstration driver: runs control scenarios against worker threads and
//! reports what the workers observed.
use crate::{
    error::{BlockingError, RuntimeError},
    exceptions::{ControlSignal, GuestException},
    executor::{Executor, StepResult},
    runtime::{Runtime, ThreadOutcome},
    sync::{Arc, AtomicU64, Ordering},
    threading::GuestThread,
};
use clap::{Parser, ValueEnum};
use std::{
    process::ExitCode,
    sync::mpsc,
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Cooperative stop/kill/suspend demonstrations on guest threads"
)]
pub struct Args {
    #[arg(value_enum, default_value_t = Scenario::All)]
    pub scenario: Scenario,
    /// Worker threads per scenario
    #[arg(short, long, default_value_t = 4)]
    pub workers: usize,
    /// Print the control metrics as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Stop,
    Kill,
    Suspend,
    Stillborn,
    Shutdown,
    All,
}

impl Scenario {
    const EACH: [Scenario; 5] = [
        Scenario::Stop,
        Scenario::Kill,
        Scenario::Suspend,
        Scenario::Stillborn,
        Scenario::Shutdown,
    ];
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{scenario:?}: {detail}")]
    Unexpected { scenario: Scenario, detail: String },
    #[error("{0:?}: a worker panicked")]
    Panicked(Scenario),
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    let scenarios: Vec<Scenario> = match args.scenario {
        Scenario::All => Scenario::EACH.to_vec(),
        one => vec![one],
    };

    let mut failed = false;
    for scenario in scenarios {
        let runtime = Runtime::from_env();
        match run_scenario(&runtime, scenario, args.workers.max(1)) {
            Ok(()) => println!("{:?}: ok", scenario),
            Err(e) => {
                eprintln!("{}", e);
                failed = true;
            }
        }
        let snapshot = runtime.metrics();
        if args.json {
            match serde_json::to_string(&snapshot) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Error serializing metrics: {}", e),
            }
        } else {
            print!("{}", snapshot);
        }
        runtime.flush_trace();
    }

    if failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

pub fn run_scenario(
    runtime: &Arc<Runtime>,
    scenario: Scenario,
    workers: usize,
) -> Result<(), ScenarioError> {
    info!("running {:?} with {} workers", scenario, workers);
    match scenario {
        Scenario::Stop => stop_spinning_workers(runtime, workers),
        Scenario::Kill => kill_sleeping_workers(runtime, workers),
        Scenario::Suspend => suspend_and_resume(runtime),
        Scenario::Stillborn => stillborn(runtime),
        Scenario::Shutdown => shutdown(runtime, workers),
        Scenario::All => Scenario::EACH
            .iter()
            .try_for_each(|&s| run_scenario(runtime, s, workers)),
    }
}

struct Worker {
    thread: Arc<GuestThread>,
    handle: JoinHandle<ThreadOutcome>,
    progress: Arc<AtomicU64>,
}

/// Starts a worker that counts loop iterations, and waits until it runs.
fn spawn_spinner(runtime: &Arc<Runtime>, name: String) -> Result<Worker, ScenarioError> {
    let thread = runtime.create_thread(name);
    let progress = Arc::new(AtomicU64::new(0));
    let (running_tx, running_rx) = mpsc::channel();
    let counter = progress.clone();
    let handle = runtime.start(&thread, move |ctx| {
        let _ = running_tx.send(());
        Executor::new(ctx).run(|_| {
            counter.fetch_add(1, Ordering::Relaxed);
            std::hint::spin_loop();
            Ok::<_, ControlSignal>(StepResult::BackEdge)
        })?;
        Ok(())
    })?;
    let _ = running_rx.recv();
    Ok(Worker {
        thread,
        handle,
        progress,
    })
}

/// Starts a worker that sleeps in a loop until something ends it.
fn spawn_sleeper(runtime: &Arc<Runtime>, name: String) -> Result<Worker, ScenarioError> {
    let thread = runtime.create_thread(name);
    let progress = Arc::new(AtomicU64::new(0));
    let counter = progress.clone();
    let handle = runtime.start(&thread, move |ctx| loop {
        match ctx.sleep(Duration::from_millis(50)) {
            Ok(()) | Err(BlockingError::Interrupted) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(BlockingError::Control(signal)) => return Err(signal),
        }
    })?;
    Ok(Worker {
        thread,
        handle,
        progress,
    })
}

fn join(scenario: Scenario, worker: Worker) -> Result<ThreadOutcome, ScenarioError> {
    worker
        .handle
        .join()
        .map_err(|_| ScenarioError::Panicked(scenario))
}

fn unexpected(scenario: Scenario, detail: impl Into<String>) -> ScenarioError {
    ScenarioError::Unexpected {
        scenario,
        detail: detail.into(),
    }
}

fn stop_spinning_workers(runtime: &Arc<Runtime>, workers: usize) -> Result<(), ScenarioError> {
    let scenario = Scenario::Stop;
    let spawned = (0..workers)
        .map(|i| spawn_spinner(runtime, format!("spinner-{}", i)))
        .collect::<Result<Vec<_>, _>>()?;

    let cause = GuestException::new("DemoStop").with_message("requested by control plane");
    for worker in &spawned {
        // Never inline: the driver is not a guest thread
        let _ = runtime.stop(&worker.thread, Some(cause.clone()));
    }
    for worker in spawned {
        let steps = worker.progress.clone();
        match join(scenario, worker)? {
            ThreadOutcome::Stopped(observed) if observed == cause => {
                info!("worker stopped after {} steps", steps.load(Ordering::Relaxed));
            }
            other => return Err(unexpected(scenario, format!("worker ended with {:?}", other))),
        }
    }
    Ok(())
}

fn kill_sleeping_workers(runtime: &Arc<Runtime>, workers: usize) -> Result<(), ScenarioError> {
    let scenario = Scenario::Kill;
    let spawned = (0..workers)
        .map(|i| spawn_sleeper(runtime, format!("sleeper-{}", i)))
        .collect::<Result<Vec<_>, _>>()?;
    thread::sleep(Duration::from_millis(20));

    runtime.request_exit(3);
    for worker in &spawned {
        let _ = runtime.kill(&worker.thread);
    }
    for worker in spawned {
        match join(scenario, worker)? {
            ThreadOutcome::Killed { exit_status: 3 } | ThreadOutcome::Stillborn => {}
            other => return Err(unexpected(scenario, format!("worker ended with {:?}", other))),
        }
    }
    Ok(())
}

fn suspend_and_resume(runtime: &Arc<Runtime>) -> Result<(), ScenarioError> {
    let scenario = Scenario::Suspend;
    let worker = spawn_spinner(runtime, "suspendee".to_owned())?;

    let _ = runtime.suspend(&worker.thread);
    let parked_at = worker.progress.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(50));
    if worker.progress.load(Ordering::Relaxed) != parked_at {
        return Err(unexpected(scenario, "worker kept running while suspended"));
    }

    runtime.resume(&worker.thread);
    thread::sleep(Duration::from_millis(20));
    if worker.progress.load(Ordering::Relaxed) == parked_at {
        return Err(unexpected(scenario, "worker did not resume"));
    }

    let _ = runtime.stop(&worker.thread, None);
    match join(scenario, worker)? {
        ThreadOutcome::Stopped(cause) if cause.is_thread_death() => Ok(()),
        other => Err(unexpected(scenario, format!("worker ended with {:?}", other))),
    }
}

fn stillborn(runtime: &Arc<Runtime>) -> Result<(), ScenarioError> {
    let scenario = Scenario::Stillborn;
    let thread = runtime.create_thread("stillborn");
    let _ = runtime.stop(&thread, None);

    let ran = Arc::new(AtomicU64::new(0));
    let flag = ran.clone();
    let handle = runtime.start(&thread, move |_| {
        flag.store(1, Ordering::Relaxed);
        Ok(())
    })?;
    match handle.join().map_err(|_| ScenarioError::Panicked(scenario))? {
        ThreadOutcome::Stillborn if ran.load(Ordering::Relaxed) == 0 => Ok(()),
        other => Err(unexpected(scenario, format!("thread ended with {:?}", other))),
    }
}

fn shutdown(runtime: &Arc<Runtime>, workers: usize) -> Result<(), ScenarioError> {
    let scenario = Scenario::Shutdown;
    let mut spawned = Vec::with_capacity(workers);
    for i in 0..workers {
        let worker = if i % 2 == 0 {
            spawn_sleeper(runtime, format!("sleeper-{}", i))?
        } else {
            spawn_spinner(runtime, format!("spinner-{}", i))?
        };
        spawned.push(worker);
    }

    let stragglers = runtime.shutdown();
    if !stragglers.is_empty() {
        return Err(unexpected(
            scenario,
            format!("threads survived shutdown: {:?}", stragglers),
        ));
    }
    for worker in spawned {
        join(scenario, worker)?;
    }

    let late = runtime.create_thread("late");
    match runtime.start(&late, |_| Ok(()))?.join() {
        Ok(ThreadOutcome::Stillborn) => Ok(()),
        Ok(other) => Err(unexpected(scenario, format!("late thread ended with {:?}", other))),
        Err(_) => Err(ScenarioError::Panicked(scenario)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;

    #[test]
    fn test_every_scenario_passes() {
        for scenario in Scenario::EACH {
            let runtime = Runtime::new(ControlConfig::default());
            run_scenario(&runtime, scenario, 2).unwrap();
        }
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["threadctl", "suspend", "--workers", "2", "--json"]);
        assert_eq!(args.scenario, Scenario::Suspend);
        assert_eq!(args.workers, 2);
        assert!(args.json);
    }
}
