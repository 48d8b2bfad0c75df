// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Payloads cross member boundaries (and sit in operation logs) as a stable
//! integer type code plus an opaque body. The receiving side picks the
//! decoder for a body by looking its type code up in the payload kind's
//! decoder table, so an unknown code or a corrupt body is reported as an
//! error for that one operation rather than taking down the actor that
//! received it.

use crate::Error;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub type Decoder<T> = fn(&[u8]) -> Result<T, Error>;

/// A closed family of payload variants, each with its own type code.
pub trait Tagged: Sized {
    /// Name of the payload family, for log messages.
    const KIND: &'static str;

    fn type_code(&self) -> u32;
    fn encode_body(&self) -> Result<Vec<u8>, Error>;
    fn decoder(type_code: u32) -> Option<Decoder<Self>>;
    fn type_codes() -> &'static [u32];
}

/// An encoded payload: type tag plus body bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    pub type_code: u32,
    pub body: Vec<u8>,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "<type {}, {} bytes>",
            self.type_code,
            self.body.len()
        ))
    }
}

impl Payload {
    pub fn encode<T: Tagged>(value: &T) -> Result<Payload, Error> {
        Ok(Payload {
            type_code: value.type_code(),
            body: value.encode_body()?,
        })
    }

    pub fn decode<T: Tagged>(&self) -> Result<T, Error> {
        match T::decoder(self.type_code) {
            None => Err(Error::UnknownRequestType(self.type_code)),
            Some(decode) => decode(&self.body),
        }
    }
}

pub(crate) fn decode_body<B: DeserializeOwned>(bytes: &[u8]) -> Result<B, Error> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn encode_body<B: Serialize>(body: &B) -> Result<Vec<u8>, Error> {
    Ok(bincode::serialize(body)?)
}

/// Implements [Tagged] for an enum whose variants each wrap one body type,
/// assigning each variant the given type code.
macro_rules! tagged_payload {
    ($kind:ident { $($code:literal => $variant:ident($body:ty)),* $(,)? }) => {
        impl crate::codec::Tagged for $kind {
            const KIND: &'static str = stringify!($kind);

            fn type_code(&self) -> u32 {
                match self {
                    $( $kind::$variant(_) => $code, )*
                }
            }

            fn encode_body(&self) -> Result<Vec<u8>, crate::Error> {
                match self {
                    $( $kind::$variant(body) => crate::codec::encode_body(body), )*
                }
            }

            fn decoder(type_code: u32) -> Option<crate::codec::Decoder<Self>> {
                match type_code {
                    $(
                        $code => Some(
                            (|bytes: &[u8]| -> Result<$kind, crate::Error> {
                                Ok($kind::$variant(crate::codec::decode_body::<$body>(bytes)?))
                            }) as crate::codec::Decoder<$kind>,
                        ),
                    )*
                    _ => None,
                }
            }

            fn type_codes() -> &'static [u32] {
                &[$($code),*]
            }
        }
    };
}
