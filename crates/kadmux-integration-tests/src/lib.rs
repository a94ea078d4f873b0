//! Integration test crate for kadmux.
//!
//! This crate has no library code. It only contains tests that drive the
//! query pool through the coordination behaviour end to end.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p kadmux-integration-tests
//! ```
