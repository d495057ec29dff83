pub mod call;
pub mod signal;
