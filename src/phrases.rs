//! End-of-run commentary selection.
//!
//! Uses its own linear-congruential generator so that phrase choice never touches
//! (or depends on) any shared random state, and tests can pin the seed.

use rand::{Rng, RngCore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const LCG_MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const LCG_INCREMENT: u64 = 1_442_695_040_888_963_407;

/// Extra draws allowed when the first draw repeats the previous pick.
const MAX_REDRAWS: usize = 3;

/// 64-bit LCG; only the high half of the state is handed out.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Self {
        let mut rng = Self {
            state: seed ^ LCG_INCREMENT,
        };
        rng.step();
        rng
    }

    /// Seed from the clock.
    pub fn from_clock() -> Self {
        Self::new(clock_seed())
    }

    fn step(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        (self.state >> 32) as u32
    }
}

impl RngCore for Lcg {
    fn next_u32(&mut self) -> u32 {
        self.step()
    }

    fn next_u64(&mut self) -> u64 {
        let hi = self.step() as u64;
        let lo = self.step() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Wall-clock nanos mixed with time since first use and a per-call counter, so
/// generators seeded back to back never share a seed.
fn clock_seed() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    static CALLS: AtomicU64 = AtomicU64::new(0);

    let since_start = START.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5EED);
    let calls = CALLS.fetch_add(1, Ordering::Relaxed);
    wall ^ since_start.rotate_left(32) ^ calls.wrapping_mul(LCG_MULTIPLIER)
}

/// Pick a phrase from `list`, avoiding an immediate repeat of `last` when possible.
///
/// Returns the phrase and the index to remember. An empty list yields no phrase and
/// hands `last` back unchanged. After [`MAX_REDRAWS`] failed redraws the repeat is
/// accepted.
pub fn pick<'a, R: RngCore>(
    rng: &mut R,
    list: &'a [String],
    last: Option<usize>,
) -> (Option<&'a str>, Option<usize>) {
    if list.is_empty() {
        return (None, last);
    }
    let mut index = rng.gen_range(0..list.len());
    let mut redraws = 0;
    while list.len() > 1 && Some(index) == last && redraws < MAX_REDRAWS {
        index = rng.gen_range(0..list.len());
        redraws += 1;
    }
    (Some(list[index].as_str()), Some(index))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCategory {
    Success,
    Failure,
}

/// Picker with per-category memory of the last choice, kept for the life of the process.
#[derive(Debug, Clone)]
pub struct PhrasePicker {
    rng: Lcg,
    last_success: Option<usize>,
    last_failure: Option<usize>,
}

impl PhrasePicker {
    pub fn new(rng: Lcg) -> Self {
        Self {
            rng,
            last_success: None,
            last_failure: None,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Lcg::new(seed))
    }

    pub fn pick(&mut self, category: PhraseCategory, list: &[String]) -> Option<String> {
        let last = match category {
            PhraseCategory::Success => &mut self.last_success,
            PhraseCategory::Failure => &mut self.last_failure,
        };
        let (phrase, index) = pick(&mut self.rng, list, *last);
        *last = index;
        phrase.map(str::to_string)
    }
}

impl Default for PhrasePicker {
    fn default() -> Self {
        Self::new(Lcg::from_clock())
    }
}
