//! Integration tests driving a session over the in-memory transport

pub mod persistence_test;
pub mod session_test;
