//! Utility functions for identifiers, hashing and serialization

use crate::error::{StoreError, decode_err, encode_err};
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Same as [`new_uuid_to_bech32`] but for the fixed prefixes the crate owns.
pub(crate) fn new_id(hrp: &str) -> Result<String, StoreError> {
    new_uuid_to_bech32(hrp).map_err(encode_err)
}

pub(crate) fn to_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(encode_err)
}

pub(crate) fn from_cbor<T>(key: &[u8], bytes: &[u8]) -> Result<T, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| decode_err(key, e))
}

/// Hex sha256 over the canonical CBOR encoding of `value`.
pub fn fingerprint<T: minicbor::Encode<()>>(value: &T) -> Result<String, StoreError> {
    let contents = to_cbor(value)?;
    Ok(sha256::digest(&contents))
}
