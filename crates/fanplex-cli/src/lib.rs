//! fanplex CLI library
//!
//! Synthetic producer/consumer runs used by the `fanplex` binary to exercise
//! merge and split sessions end to end.

pub mod soak;
