//! Integration tests for portwarden
//!
//! # Test Organization
//!
//! - `ipc_roundtrip`: IPC client/server over TCP (port-file discovery) and
//!   Unix sockets, driven through `RemoteController`
//! - `controller_selection`: daemon-or-embed selection at startup
//! - `relay_forwarding`: local controller end to end with the relay backend
//! - `single_instance`: instance lock and wake-up channel
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//! cargo test --test integration_tests relay
//! ```
//!
//! All tests bind loopback sockets only and keep their files in temp dirs.

pub mod support;

pub mod controller_selection;
pub mod ipc_roundtrip;
pub mod relay_forwarding;
pub mod single_instance;
