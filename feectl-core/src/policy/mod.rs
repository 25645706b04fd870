/// Validation errors
pub mod error;
/// Per-channel change history
pub mod history;
/// The safety gate
pub mod validator;
