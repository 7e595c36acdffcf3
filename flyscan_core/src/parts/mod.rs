//! Parts a scan controller can be assembled from.

pub mod child;
pub mod detector;
pub mod panda;
pub mod pmac;

pub use child::RunnableChildPart;
pub use detector::{DETECTORS, DetectorPart};
pub use panda::SequencerPart;
pub use pmac::TrajectoryPart;
