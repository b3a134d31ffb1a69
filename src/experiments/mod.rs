//! Ready-made networks shared by the binary, benchmarks and tests.

pub mod lif;

pub use lif::{lif_network, LifParams};
