//! Data model - devices, parameters and generated samples

mod device;
mod sample;

pub use device::*;
pub use sample::{GeneratedSample, SampleValue};
