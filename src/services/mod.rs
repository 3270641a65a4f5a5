pub mod batch;
pub mod classification;
pub mod classifier;
pub mod events;
pub mod image_probe;
pub mod providers;
pub mod storage;
pub mod trainer;
