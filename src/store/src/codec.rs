use serde::{de::DeserializeOwned, Serialize};

use super::error::Error;

/// Converts stored values to and from the bytes kept in the durable table.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error>;
    fn decode(&self, bytes: &[u8]) -> Result<T, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(Box::new(e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(Box::new(e)))
    }
}

/// Codec assembled from a pair of closures.
pub struct FnCodec<E, D> {
    encode: E,
    decode: D,
}

impl<E, D> FnCodec<E, D> {
    pub fn new(encode: E, decode: D) -> FnCodec<E, D> {
        FnCodec { encode, decode }
    }
}

impl<T, E, D> Codec<T> for FnCodec<E, D>
where
    E: Fn(&T) -> Result<Vec<u8>, Error> + Send + Sync,
    D: Fn(&[u8]) -> Result<T, Error> + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error> {
        (self.encode)(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, Error> {
        (self.decode)(bytes)
    }
}
