pub mod config;
pub mod error;
pub mod gpu;
pub mod hmm;
pub mod host;
pub mod page;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::{HmmConfig, SpaceFlags};
pub use error::{HmmError, HmmResult};
pub use hmm::space::{VaSpace, VaSpaceLocked};
