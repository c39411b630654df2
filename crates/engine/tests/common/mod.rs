//! Common test utilities and fixtures.

pub mod fetcher;
pub mod fixtures;
pub mod harness;

#[allow(unused_imports)]
pub use fetcher::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use harness::*;
