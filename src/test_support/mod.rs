//! Test-only wiring: mock upstream server and app harness.

pub mod harness;
pub mod mock;

pub use harness::AppHarness;
pub use mock::{MockBody, MockResponse, MockUpstream, RecordedRequest, Responder};
