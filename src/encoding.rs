//! Bincode is used to encode values, both in the storage engine and in
//! messages between members. It is a Rust-specific encoding that depends on
//! the internal data structures being stable, but it's sufficient here.
//!
//! This module wraps the bincode crate to always use DefaultOptions, in
//! particular variable-length rather than fixed-length integers. Confusingly,
//! upstream bincode::(de)serialize uses different options (fixed) than
//! DefaultOptions (variable).

use crate::error::Result;

use bincode::Options as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Serializes a value using Bincode. Can't fail for the types used here.
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode().serialize(value).expect("value must be serializable")
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// A serializable value, encoded and decoded with Bincode.
pub trait Value: Serialize + DeserializeOwned {
    fn encode(&self) -> Vec<u8> {
        serialize(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        deserialize(bytes)
    }
}
