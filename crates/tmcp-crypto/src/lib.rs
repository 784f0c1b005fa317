#![forbid(unsafe_code)]

pub mod hash;
pub mod transcript;
pub mod keys;

pub mod envelope;
pub mod replay;

#[cfg(test)]
mod proptests;
