//! Test support for idcore backends and handlers.
//!
//! - [`contract`]: behavioral suites every [`EventStore`](idcore::EventStore)
//!   and [`HandlerStateStore`](idcore::HandlerStateStore) backend must pass,
//!   plus macros generating one `#[tokio::test]` per scenario
//! - [`chaos`]: failure injection for statement executors
//! - [`recording`]: a handler with scripted failures
//! - [`clock`]: a manually advanced clock

#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unreachable_pub,
    unused_allocation,
    unsafe_code
)]
#![deny(
    bad_style,
    clippy::allow_attributes,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_qualifications,
    unused_results,
    unused_variables
)]

pub mod chaos;
pub mod clock;
pub mod contract;
pub mod recording;

pub use chaos::{ChaosConfig, ChaosExecutor, ChaosExecutorExt};
pub use clock::ManualClock;
pub use recording::RecordingHandler;
