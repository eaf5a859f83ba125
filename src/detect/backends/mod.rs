pub mod synthetic;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use synthetic::SyntheticDetector;

#[cfg(feature = "backend-tract")]
pub use tract::{OpenVocabDetector, TractOptions, YoloDetector};
