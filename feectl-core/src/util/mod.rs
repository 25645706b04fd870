/// Clock abstraction
pub mod clock;
/// Content hashing and payload compression
pub mod codec;
/// Shared test fixtures and mocks
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
