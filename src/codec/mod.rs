//! Codec parsers for the supported stream families.

pub mod aac;
pub mod h264;
