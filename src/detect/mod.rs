mod backend;
pub mod backends;
pub mod decode;
mod result;

pub use backend::{Detector, DetectorKind};
pub use backends::SyntheticDetector;
pub use decode::ClassLabels;
pub use result::{BoundingBox, Detection};
