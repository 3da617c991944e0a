//! Common types and helpers shared by the ibis crates.

pub mod bitset;

pub mod prelude {
    pub use std::borrow::ToOwned;
    pub use std::boxed::Box;
    pub use std::collections::HashMap;
    pub use std::collections::HashSet;
    pub use std::collections::VecDeque;
    pub use std::format;
    pub use std::string::String;
    pub use std::string::ToString;
    pub use std::vec;
    pub use std::vec::Vec;
}

/// The value of a single coin in satoshis.
pub const COIN_VALUE: u64 = 100_000_000;

/// The largest amount of satoshis that will ever exist, 21 million coins.
pub const MAX_MONEY: u64 = 21_000_000 * COIN_VALUE;

/// Outputs below this value are considered dust by policy.
pub const DUST_THRESHOLD: u64 = 546;
