//! Built-in filters
//!
//! Registered by [`FilterRegistry::with_builtins`](crate::filter::FilterRegistry::with_builtins)
//! in the order below, which is also the tie-break order of the linker.

pub mod fin;
pub mod fout;
pub mod inspect;
pub mod reframer;
pub mod testsrc;

pub use fin::FileInput;
pub use fout::FileOutput;
pub use inspect::{Inspect, InspectReport, PidRecord};
pub use reframer::Reframer;
pub use testsrc::TestSource;

use crate::filter::FilterDescriptor;

pub fn builtin_descriptors() -> Vec<FilterDescriptor> {
    vec![
        testsrc::descriptor(),
        fin::descriptor(),
        fout::descriptor(),
        reframer::descriptor(),
        inspect::descriptor(),
    ]
}
