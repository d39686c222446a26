//! End-to-end tests for the zgw-doip engine
//!
//! Every test drives a full connection (reader task, owner loop and
//! alive-check ticker) over an in-memory `tokio::io::duplex` pipe, with a
//! scripted tester on the other end. Timer behaviour runs on tokio's paused
//! clock, so no test sleeps in real time.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p zgw-tests
//! ```
//!
//! # Test Structure
//!
//! - `download_e2e_test.rs` - RequestDownload / TransferData / RequestTransferExit
//!   with software package verification
//! - `routing_e2e_test.rs` - routing activation, alive checks, expiry and teardown
//! - `telemetry_e2e_test.rs` - reports, consolidated DIDs and report routines
//! - `framing_e2e_test.rs` - malformed frames and generic NACKs
//! - `common/mod.rs` - the scripted tester

// This crate only contains tests, no library code
