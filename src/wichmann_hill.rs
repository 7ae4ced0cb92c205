use std::fmt;

use thiserror::Error;

pub const MULTIPLIERS: [u32; 3] = [171, 172, 170];
pub const MODULI: [u32; 3] = [30269, 30307, 30323];

/// Seed the target game initialises its generator with.
pub const DEFAULT_SEED: GeneratorState = GeneratorState([100, 100, 100]);

/// Default cap on how far [`forward_search`] walks before giving up.
pub const DEFAULT_MAX_SEARCH_STEPS: u64 = 100_000_000;

// ─── GeneratorState ─────────────────────────────────────────────────────────

/// The three Wichmann-Hill words. Word `i` is always below `MODULI[i]` for
/// states produced by [`GeneratorState::new`] or [`step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneratorState([u32; 3]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateDecodeError {
    #[error("expected 12 bytes of generator state, got {0}")]
    Length(usize),
    #[error("word {index} = {value} is outside its modulus {modulus}")]
    OutOfRange { index: usize, value: u32, modulus: u32 },
}

impl GeneratorState {
    pub fn new(words: [u32; 3]) -> Result<Self, StateDecodeError> {
        for (index, (&value, &modulus)) in words.iter().zip(MODULI.iter()).enumerate() {
            if value >= modulus {
                return Err(StateDecodeError::OutOfRange {
                    index,
                    value,
                    modulus,
                });
            }
        }
        Ok(Self(words))
    }

    /// Decode three big-endian `u32` words as read from target memory.
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, StateDecodeError> {
        let raw: &[u8; 12] = bytes
            .try_into()
            .map_err(|_| StateDecodeError::Length(bytes.len()))?;
        let word = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self::new([word(0), word(4), word(8)])
    }

    pub fn to_be_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn words(&self) -> [u32; 3] {
        self.0
    }
}

impl Default for GeneratorState {
    fn default() -> Self {
        DEFAULT_SEED
    }
}

impl fmt::Display for GeneratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "[{a}, {b}, {c}]")
    }
}

// ─── Stepping ───────────────────────────────────────────────────────────────

/// Advance `state` by one generator step and return the value in `[0, 1)`
/// the generator would hand out.
pub fn step(state: &mut GeneratorState) -> f64 {
    let mut value = 0.0;
    for i in 0..3 {
        state.0[i] = state.0[i] * MULTIPLIERS[i] % MODULI[i];
        value += f64::from(state.0[i]) / f64::from(MODULI[i]);
    }
    value % 1.0
}

// ─── Forward search ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SearchOutcome {
    /// `known` now equals the target, `steps` generator steps later.
    Found { steps: u64 },
    /// The caller asked to stop; `known` is left mid-walk.
    Cancelled { steps: u64 },
    /// The target was not reached within the bound. `known` has been
    /// realigned to the target.
    Exhausted { steps: u64 },
}

impl SearchOutcome {
    pub fn steps(&self) -> u64 {
        match *self {
            SearchOutcome::Found { steps }
            | SearchOutcome::Cancelled { steps }
            | SearchOutcome::Exhausted { steps } => steps,
        }
    }
}

/// Step `known` forward until it equals `target`, polling `should_continue`
/// before every step.
pub fn forward_search(
    target: GeneratorState,
    known: &mut GeneratorState,
    max_steps: u64,
    mut should_continue: impl FnMut() -> bool,
) -> SearchOutcome {
    let mut steps = 0u64;
    while *known != target {
        if !should_continue() {
            return SearchOutcome::Cancelled { steps };
        }
        if steps >= max_steps {
            *known = target;
            return SearchOutcome::Exhausted { steps };
        }
        step(known);
        steps += 1;
    }
    SearchOutcome::Found { steps }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
