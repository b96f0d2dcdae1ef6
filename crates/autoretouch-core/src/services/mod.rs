pub mod processing;

pub use processing::{BatchItem, ImageProcessor};
