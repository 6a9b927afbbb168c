//! Seeded randomness for simulation runs.
//!
//! One iteration seed fans out into labelled [`Stream`]s: consumer choices,
//! faults, lane scheduling and one stream per lane's script. Stream seeds
//! are derived from the iteration seed and the label alone, never from
//! draws, so adding a draw to one component leaves every other component's
//! choices unchanged and a failing seed keeps reproducing after the harness
//! changes elsewhere.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

/// Draw count past which a run is almost certainly stuck in a loop.
const DRAWS_COUNT_MAX: u64 = 1_000_000_000;

/// Odd constant used to spread stream labels across the seed space.
const STREAM_SPREAD: u64 = 0x9E37_79B9_7F4A_7C15;

/// A named source of randomness inside one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Which operation a consumer performs next.
    Consumer,
    /// Fault decisions, shared by routine generation and consumers.
    Faults,
    /// Lane interleaving.
    Scheduler,
    /// The shape of one lane's script.
    Script(usize),
}

impl Stream {
    fn label(self) -> u64 {
        match self {
            Self::Consumer => 1,
            Self::Faults => 2,
            Self::Scheduler => 3,
            Self::Script(lane) => 0x100 + lane as u64,
        }
    }
}

/// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Xoshiro256** generator that remembers its seed and counts its draws.
///
/// # Example
///
/// ```rust
/// use coseq_dst::random::{DeterministicRng, Stream};
///
/// let iteration = DeterministicRng::new(7);
/// let mut faults = iteration.stream(Stream::Faults);
/// let first = faults.gen_range(0..100u32);
///
/// let mut replay = DeterministicRng::new(7).stream(Stream::Faults);
/// assert_eq!(replay.gen_range(0..100u32), first);
/// ```
pub struct DeterministicRng {
    seed: u64,
    rng: Xoshiro256StarStar,
    draws_count: u64,
}

impl DeterministicRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        debug_assert!(seed != 0, "Seed should not be zero");

        Self {
            seed,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            draws_count: 0,
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of values drawn since creation.
    #[must_use]
    pub fn draws_count(&self) -> u64 {
        self.draws_count
    }

    /// The generator for `stream`, derived from this generator's seed only.
    #[must_use]
    pub fn stream(&self, stream: Stream) -> Self {
        let seed = mix(self.seed ^ stream.label().wrapping_mul(STREAM_SPREAD));
        Self::new(seed.max(1))
    }

    fn count_draw(&mut self) {
        self.draws_count += 1;
        debug_assert!(self.draws_count < DRAWS_COUNT_MAX, "Runaway RNG use");
    }

    pub fn gen<T>(&mut self) -> T
    where
        rand::distributions::Standard: rand::distributions::Distribution<T>,
    {
        self.count_draw();
        self.rng.gen()
    }

    pub fn gen_range<T, R>(&mut self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.count_draw();
        self.rng.gen_range(range)
    }

    /// `true` with the given probability. A zero probability draws nothing,
    /// so a disabled fault leaves its stream untouched.
    pub fn gen_bool(&mut self, probability: f64) -> bool {
        debug_assert!((0.0..=1.0).contains(&probability), "Probability must be in [0.0, 1.0]");
        if probability <= 0.0 {
            return false;
        }
        self.count_draw();
        self.rng.gen_bool(probability)
    }

    /// Index into `weights`, chosen in proportion to each weight.
    ///
    /// Zero weights are never picked.
    pub fn pick_weighted(&mut self, weights: &[u32]) -> usize {
        let total: u32 = weights.iter().sum();
        debug_assert!(total > 0, "At least one weight must be positive");
        if total == 0 {
            return 0;
        }
        let mut roll = self.gen_range(0..total);
        for (index, &weight) in weights.iter().enumerate() {
            if roll < weight {
                return index;
            }
            roll -= weight;
        }
        weights.len() - 1
    }

    pub fn choose<'a, T>(&mut self, slice: &'a [T]) -> Option<&'a T> {
        use rand::seq::SliceRandom;
        self.count_draw();
        slice.choose(&mut self.rng)
    }

    /// A non-zero seed for a replayable iteration.
    pub fn gen_seed(&mut self) -> u64 {
        self.gen::<u64>().max(1)
    }
}
