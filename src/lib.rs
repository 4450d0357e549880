// Count tables and array offsets are indexed with usize
#[cfg(target_pointer_width = "32")]
compile_error!("kwip requires a 64-bit target to address large counting tables.");

pub mod array;
pub mod config;
pub mod counts;
pub mod entropy;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod matrix;
pub mod output;
pub mod popstats;

pub use counts::{CountSource, CountTable, MemorySource, Sample, StoreSource};
pub use entropy::{EntropyVector, binary_entropy};
pub use error::{KwipError, Result};
pub use kernel::{D2, D2Pop, JensenShannon, Kernel, KernelEngine, Metric, WeightedInnerProduct};
pub use matrix::KernelMatrix;
pub use popstats::PopulationStats;
