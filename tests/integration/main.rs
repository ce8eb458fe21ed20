//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! of the device against the recording mock board.  All tests run on the
//! host with no real board required.

mod notification_tests;
mod restore_tests;
