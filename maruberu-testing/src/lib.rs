//! Shared test tooling for maruberu storage backends and bell scenarios.
//!
//! - [`contract`]: the behavioral suite every `ResourceStorage` must pass,
//!   wired into a backend's tests with `resource_storage_contract_tests!`
//! - [`chaos`]: a storage wrapper that injects infrastructure failures
//! - [`doubles`]: scripted actuators and a bell that accepts everything

#![forbid(unsafe_code)]
#![deny(
    bad_style,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_variables
)]

pub mod chaos;
pub mod contract;
pub mod doubles;

pub use chaos::*;
pub use doubles::*;
