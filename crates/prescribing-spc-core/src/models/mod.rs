//! Domain models for the prescribing SPC pipeline.

mod funnel;
mod observation;
mod period;
mod quality;
mod spc;

pub use funnel::*;
pub use observation::*;
pub use period::*;
pub use quality::*;
pub use spc::*;
