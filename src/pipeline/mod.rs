//! Audio pipeline for stem separation.
//!
//! Samples flow windower → scheduler → engine → post-processor → outbound
//! channel. Each connection owns one windower and one scheduler; the
//! blocking worker pool is shared.

pub mod post_processor;
pub mod scheduler;
pub mod types;
pub mod windower;

pub use post_processor::{PostProcessorConfig, StemPostProcessor};
pub use scheduler::ProcessingScheduler;
pub use types::{AudioWindow, StemBuffer, StemMap, StemResult};
pub use windower::{SampleWindower, WindowerConfig};
