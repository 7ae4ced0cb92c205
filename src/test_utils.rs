use proptest::prelude::*;

use crate::wichmann_hill::{GeneratorState, MODULI, step};

// ─── Generator state strategies ─────────────────────────────────────────────

/// States reachable by the generator: every word non-zero and below its modulus.
pub fn arb_generator_state() -> impl Strategy<Value = GeneratorState> {
    (1..MODULI[0], 1..MODULI[1], 1..MODULI[2]).prop_map(|(a, b, c)| {
        GeneratorState::new([a, b, c]).expect("generated words are below their moduli")
    })
}

/// `state` after `steps` generator steps.
pub fn advanced(state: GeneratorState, steps: u64) -> GeneratorState {
    let mut out = state;
    for _ in 0..steps {
        step(&mut out);
    }
    out
}
