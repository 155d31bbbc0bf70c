//! Binary encoding of values that cross a thread pool, scheduler or broker boundary.
//!
//! Particles travel as `bincode`, which writes floats bit for bit, so NaN and
//! infinities come back exactly as they were simulated. JSON stays reserved
//! for configuration.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(value)?)
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(bincode::deserialize(bytes)?)
}
