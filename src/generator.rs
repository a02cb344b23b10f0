//! Background data generator: synthesises `Z*S*V` non-negative samples for a
//! validated spectrum, cancellable and pauseable at energy-step granularity.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::Receiver;
use jiff::Timestamp;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::engine::EngineState;
use crate::spectrum::SpectrumSpec;

const PEAK: f64 = 1000.0;
const NOISE_FRACTION: f64 = 0.1;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// State shared between the dispatcher thread and the generator thread,
/// guarded by a single mutex per the append-only-while-running contract.
pub struct Shared {
    pub state: EngineState,
    pub buffer: Vec<f64>,
    /// Completed energy samples within the current slice pass, in `[0, S]`.
    pub progress: usize,
    pub started_at: Option<Timestamp>,
    pub error: Option<String>,
}

impl Shared {
    pub fn new() -> Self {
        Shared {
            state: EngineState::Idle,
            buffer: Vec::new(),
            progress: 0,
            started_at: None,
            error: None,
        }
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks `shared`, recovering from poison instead of panicking: a generator
/// that fails mid-write records its own failure into `Shared` before it
/// finishes (see `run`), so a poisoned lock still holds state a status query
/// can read.
pub(crate) fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Spawns the generator on its own thread. `exit_rx` is a rendezvous
/// (`bounded(0)`) channel the engine fires on `Abort`/`Disconnect`, checked
/// at each energy step alongside the shared state flag — the same
/// exit-channel-plus-polling shape this codebase already uses for its other
/// long-running worker thread.
pub fn spawn(
    spec: SpectrumSpec,
    shared: Arc<Mutex<Shared>>,
    time_scale: f64,
    seed: u64,
    exit_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || run(spec, shared, time_scale, seed, exit_rx))
}

/// Runs one full (or aborted) generation pass synchronously on the calling
/// thread. [`spawn`] is the normal entry point; this is exposed so callers
/// that already own a dedicated thread (tests, benchmarks) can drive a pass
/// without an extra thread hop, passing a never-firing channel when no
/// external cancellation is needed.
///
/// An unexpected failure inside the pass (a panic) is caught rather than
/// left to unwind onto the caller: it is recorded into `Shared` as
/// [`EngineState::Error`] with a descriptive message, per the engine's
/// generator-failure contract, instead of poisoning the mutex for everyone
/// else polling status.
pub fn run(
    spec: SpectrumSpec,
    shared: Arc<Mutex<Shared>>,
    time_scale: f64,
    seed: u64,
    exit_rx: Receiver<()>,
) {
    let failure_target = Arc::clone(&shared);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_generation(&spec, &shared, time_scale, seed, &exit_rx)
    }));
    if let Err(payload) = outcome {
        let message = describe_panic(&payload);
        log::error!("acquisition generator failed: {message}");
        let mut g = lock(&failure_target);
        g.state = EngineState::Error;
        g.error = Some(message);
    }
}

fn describe_panic(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "acquisition generator panicked".to_string()
    }
}

fn run_generation(
    spec: &SpectrumSpec,
    shared: &Arc<Mutex<Shared>>,
    time_scale: f64,
    seed: u64,
    exit_rx: &Receiver<()>,
) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let s_count = spec.num_samples();
    let v_count = spec.values_per_sample as usize;
    let z_count = spec.num_slices as usize;
    let scans = spec.num_scans.max(1) as usize;
    let (center, sigma) = spec.center_sigma();
    let dwell = Duration::from_secs_f64((spec.dwell_time / time_scale.max(1e-9)).max(0.0));
    let mut exited = false;

    for z in 0..z_count {
        {
            let mut g = lock(shared);
            g.progress = 0;
        }
        for s in 0..s_count {
            if !wait_while_paused(shared, exit_rx, &mut exited) {
                return;
            }

            let energy = spec.energy_at(s);
            let slice_offset = (z as f64 - z_count as f64 / 2.0) * 0.1;
            let mut accum = vec![0f64; v_count];

            for _scan in 0..scans {
                for (v, slot) in accum.iter_mut().enumerate() {
                    if is_aborted(shared, exit_rx, &mut exited) {
                        return;
                    }
                    let spatial_offset = (v as f64 - v_count as f64 / 2.0) * 0.2;
                    let effective = energy + spatial_offset + slice_offset;
                    let mut intensity =
                        PEAK * (-((effective - center).powi(2)) / (2.0 * sigma * sigma)).exp();
                    let noise_frac: f64 = rng.gen_range(-NOISE_FRACTION..=NOISE_FRACTION);
                    intensity += intensity * noise_frac;
                    *slot += intensity.max(0.0);
                }
            }
            for value in accum.iter_mut() {
                *value /= scans as f64;
            }

            {
                let mut g = lock(shared);
                g.buffer.extend_from_slice(&accum);
                g.progress = s + 1;
            }

            if !dwell.is_zero() {
                thread::sleep(dwell);
            }
        }
    }

    let mut g = lock(shared);
    if g.state == EngineState::Running {
        g.state = EngineState::Finished;
    }
}

/// `try_recv` only ever observes the single rendezvous value once; `exited`
/// latches that observation so later checks in the same pass still see it.
fn is_aborted(shared: &Arc<Mutex<Shared>>, exit_rx: &Receiver<()>, exited: &mut bool) -> bool {
    if *exited || exit_rx.try_recv().is_ok() {
        *exited = true;
        return true;
    }
    lock(shared).state == EngineState::Aborted
}

/// Blocks while paused, polling at a fixed interval; returns `false` if
/// aborted while waiting (or before starting) so the caller can stop.
fn wait_while_paused(shared: &Arc<Mutex<Shared>>, exit_rx: &Receiver<()>, exited: &mut bool) -> bool {
    loop {
        if is_aborted(shared, exit_rx, exited) {
            return false;
        }
        let state = lock(shared).state;
        match state {
            EngineState::Paused => thread::sleep(PAUSE_POLL_INTERVAL),
            EngineState::Aborted => return false,
            _ => return true,
        }
    }
}
