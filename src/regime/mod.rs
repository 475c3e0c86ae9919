//! Market regime classification with hysteresis.

mod classifier;

pub use classifier::RegimeClassifier;
