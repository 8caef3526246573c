//! Per-slot value codecs.
//!
//! Values cross rank boundaries serialized by value. Each input slot of a
//! task template carries a [`ValueCodec`] built from the slot's concrete
//! type at wiring time, so the dispatch core can stay untyped while remote
//! deliveries still round-trip through a real wire format.

use std::any::{Any, TypeId};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::key::Datum;

/// A type-erased value held in a pending record's slot.
#[doc(hidden)]
pub type ErasedValue = Box<dyn Any + Send>;

type EncodeFn = Box<dyn Fn(&(dyn Any + Send)) -> Result<Vec<u8>, ProtocolError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<ErasedValue, ProtocolError> + Send + Sync>;

/// Wire codec for one input slot, fixed to the slot's concrete value type.
#[doc(hidden)]
pub struct ValueCodec {
    type_name: &'static str,
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl ValueCodec {
    pub(crate) fn of<V: Datum>() -> Self {
        Self {
            type_name: std::any::type_name::<V>(),
            type_id: TypeId::of::<V>(),
            encode: Box::new(|value| {
                let value = value.downcast_ref::<V>().ok_or(ProtocolError::Codec {
                    type_name: std::any::type_name::<V>(),
                    detail: "value does not have the slot's type".into(),
                })?;
                serde_json::to_vec(value).map_err(|e| ProtocolError::Codec {
                    type_name: std::any::type_name::<V>(),
                    detail: e.to_string(),
                })
            }),
            decode: Box::new(|bytes| {
                let value: V = serde_json::from_slice(bytes).map_err(|e| ProtocolError::Codec {
                    type_name: std::any::type_name::<V>(),
                    detail: e.to_string(),
                })?;
                Ok(Box::new(value))
            }),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn encode(&self, value: &(dyn Any + Send)) -> Result<Vec<u8>, ProtocolError> {
        (self.encode)(value)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<ErasedValue, ProtocolError> {
        (self.decode)(bytes)
    }
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Codec {
        type_name: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Codec {
        type_name: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_slot_codec() {
        let codec = ValueCodec::of::<Vec<u32>>();
        let wire = codec.encode(&vec![1u32, 2, 3]).unwrap();
        let back = codec.decode(&wire).unwrap();
        assert_eq!(*back.downcast::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn encode_rejects_foreign_type() {
        let codec = ValueCodec::of::<u64>();
        let err = codec.encode(&"oops".to_string()).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { .. }));
    }
}
