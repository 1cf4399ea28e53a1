//! Process-style worker parallelism over transmitters, realized with
//! threads: each worker owns a private solver context and event graph
//! rebuilt from the shared immutable skeleton, pulls single-transmitter
//! jobs from a queue, and ships its leaks back as serialized messages.
//! A worker that dies gets its job requeued once; a second death marks
//! the transmitter permanently failed.

use crate::aeg::Aeg;
use crate::cfg::expanded::CfgExpanded;
use crate::cfg::NodeRef;
use crate::config::Config;
use crate::error::{Result, SpecterError};
use crate::ir::AliasOracle;
use crate::leakage::{Detector, Leakage, LeakageMsg};
use std::collections::{BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use z3::SatResult;

struct Job {
    transmitter: NodeRef,
    attempts: u32,
}

/// Run detection for every candidate transmitter across
/// `config.max_parallel` workers and return the deduplicated leaks.
pub fn detect_parallel(
    po: &CfgExpanded,
    oracle: &dyn AliasOracle,
    config: &Config,
) -> Result<Vec<(Leakage, String)>, SpecterError> {
    // Candidate enumeration happens once, in the parent.
    let candidates: Vec<NodeRef> = {
        let z3 = z3::Context::new(&z3::Config::new());
        let aeg = Aeg::construct(&z3, po, oracle, config)?;
        let mut detector = Detector::new(&aeg, oracle, config);
        if detector.solver.timed_check() == SatResult::Unsat {
            info!("base event-graph constraints unsatisfiable");
            return Ok(Vec::new());
        }
        match detector.candidate_transmitters() {
            Ok(c) => c,
            Err(skip) => {
                info!(%skip, "analysis skipped");
                return Ok(Vec::new());
            }
        }
    };
    info!(
        count = candidates.len(),
        workers = config.max_parallel,
        "parallel detection"
    );

    let queue: Mutex<VecDeque<Job>> = Mutex::new(
        candidates
            .into_iter()
            .map(|transmitter| Job {
                transmitter,
                attempts: 0,
            })
            .collect(),
    );
    let (tx, rx) = mpsc::channel::<(NodeRef, Result<Vec<u8>, String>)>();

    std::thread::scope(|scope| {
        for _ in 0..config.max_parallel {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || loop {
                let job = queue.lock().unwrap().pop_front();
                let Some(job) = job else { break };
                debug!(transmitter = %job.transmitter, "worker starting");
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    worker_run(po, oracle, config, job.transmitter)
                }));
                let failure = match outcome {
                    Ok(Ok(bytes)) => {
                        let _ = tx.send((job.transmitter, Ok(bytes)));
                        None
                    }
                    Ok(Err(err)) => Some(err),
                    Err(_) => Some("worker panicked".to_string()),
                };
                if let Some(reason) = failure {
                    if job.attempts == 0 {
                        warn!(transmitter = %job.transmitter, %reason, "worker failed, restarting");
                        queue.lock().unwrap().push_back(Job {
                            transmitter: job.transmitter,
                            attempts: 1,
                        });
                    } else {
                        let _ = tx.send((job.transmitter, Err(reason)));
                    }
                }
            });
        }
        drop(tx);
    });

    let mut leaks: Vec<(Leakage, String)> = Vec::new();
    for (transmitter, result) in rx.iter() {
        match result {
            Ok(bytes) => {
                for line in bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
                    let msg: LeakageMsg = serde_json::from_slice(line)?;
                    leaks.push((msg.to_leak(), msg.desc));
                }
            }
            Err(reason) => {
                warn!(%transmitter, %reason, "transmitter permanently failed");
            }
        }
    }

    let mut seen = BTreeSet::new();
    leaks.retain(|(leak, _)| seen.insert((leak.transmitter, leak.vec.clone())));
    Ok(leaks)
}

/// One worker job: rebuild the event graph in a private context, detect
/// on a single transmitter with a windowed solver, serialize the leaks.
fn worker_run(
    po: &CfgExpanded,
    oracle: &dyn AliasOracle,
    config: &Config,
    transmitter: NodeRef,
) -> Result<Vec<u8>, String> {
    let z3 = z3::Context::new(&z3::Config::new());
    let aeg = Aeg::construct(&z3, po, oracle, config).map_err(|e| e.to_string())?;
    let mut detector = Detector::new(&aeg, oracle, config);
    detector.run_one(transmitter, true);
    detector.dedup_leaks();
    let mut buf = Vec::new();
    for msg in detector.into_messages() {
        serde_json::to_writer(&mut buf, &msg).map_err(|e| e.to_string())?;
        buf.push(b'\n');
    }
    Ok(buf)
}
