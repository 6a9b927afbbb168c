//! # coseq-dst
//!
//! Deterministic simulation testing for `coseq-core` sequences.
//!
//! Randomly generated routines (yields, nested cleanup scopes, delegation,
//! raises) are driven by randomly misbehaving consumers (`send`, early
//! `return`, injected `throw`, deadlines) across interleaved lanes. Every
//! operation is recorded and checked against the protocol invariants, and
//! fault-free lanes are compared with what their script predicts. Time,
//! randomness, faults and interleaving all derive from one seed.
//!
//! ```rust
//! use coseq_dst::{Simulation, SimulationConfig};
//!
//! let report = Simulation::new(12345, SimulationConfig::quick())
//!     .and_then(|simulation| simulation.run())
//!     .unwrap();
//! println!("{report}");
//! ```
//!
//! ## Reproducibility
//!
//! ```bash
//! DST_SEED=12345 cargo test -p coseq-dst
//! DST_SEED=12345 coseq-sim --iterations 1
//! ```

pub mod clock;
pub mod env;
pub mod fault;
pub mod harness;
pub mod random;
pub mod routine;
pub mod scheduler;

pub use clock::{Deadline, SimClock};
pub use env::{DstEnv, DstStats};
pub use fault::{ConsumerFault, FaultConfig, FaultInjector, FaultStats};
pub use harness::{Simulation, SimulationConfig, SimulationError, SimulationReport};
pub use random::{DeterministicRng, Stream};
pub use routine::{Action, Ending, Oracle, EffectCounters, Script, SimError};
pub use scheduler::{ScheduleDecision, Scheduler};

use tracing::{info, warn};

/// Seed from `DST_SEED`, or a fresh random one.
///
/// The seed is logged either way; an unparsable `DST_SEED` is reported and
/// replaced.
#[must_use]
pub fn get_or_generate_seed() -> u64 {
    if let Ok(raw) = std::env::var("DST_SEED") {
        match raw.parse::<u64>() {
            Ok(seed) if seed != 0 => {
                info!(seed, "DST_SEED from environment");
                return seed;
            }
            _ => warn!(value = %raw, "DST_SEED is not a non-zero u64; generating one"),
        }
    }
    let seed = rand::random::<u64>().max(1);
    info!(seed, "DST_SEED generated");
    seed
}
