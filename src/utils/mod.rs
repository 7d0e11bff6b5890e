pub mod deterministic_rng;

pub use deterministic_rng::Pcg32;
