#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod activation;
pub mod authority;
pub mod cache;
pub mod events;
pub mod filter;
pub mod net;
pub mod store;
pub mod upstream;

#[cfg(test)]
pub mod test_util;
