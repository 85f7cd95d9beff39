pub mod config;
pub mod dump;
pub mod sql;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
