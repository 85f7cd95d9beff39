//! Test utilities for schemaops.
//!
//! In-memory stand-ins for the two external collaborators: a MySQL instance
//! speaking the statements the pipelines issue, and a schema dumper replaying
//! against it.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::{FakeFleet, FakeMysql};
//!
//! let server = FakeMysql::new("db-1", 3306)
//!     .with_table("orders", "items", 10)
//!     .with_trigger("orders", "items", "items_bi");
//! let fleet = FakeFleet::new().with_server(server.clone());
//! ```

mod fake_dumper;
mod fake_mysql;

pub use fake_dumper::FakeDumper;
pub use fake_mysql::{FakeDatabase, FakeFleet, FakeMysql, FakeSession, FakeTable, FakeTrigger};
