#![forbid(unsafe_code)]

pub mod hash;
pub mod chash;
pub mod canonical;
pub mod address;
pub mod identity;

pub mod envelope;
pub mod utils;

#[cfg(test)]
mod proptests;
