//! Property-based tests

pub mod store_proptest;
pub mod transaction_proptest;
