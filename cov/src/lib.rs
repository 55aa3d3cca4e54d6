//! Edge coverage collection over a shared memory bitmap.
//!
//! An instrumented target announces its number of edge guards in the
//! region header and flips one bit per taken edge while it runs. The
//! [`CoverageCollector`] on the fuzzer side owns the region, hands its
//! name to the target through [`layout::SHM_ENV_VAR`] and scans the
//! bitmap after every sample.

pub mod collector;
pub mod edge;
pub mod error;
pub mod layout;
pub mod region;

pub use collector::CoverageCollector;
pub use edge::{EdgeIndex, EdgeSet};
pub use error::{CoverageError, Result};
pub use region::Region;
