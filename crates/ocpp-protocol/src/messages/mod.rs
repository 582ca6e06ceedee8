//! Request/response payloads.
//!
//! Each request type implements [`Operation`], which names the OCPP action
//! and the response type it is answered with. The direction markers
//! [`CsmsOperation`] and [`StationOperation`] say who may initiate the call.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Implements [`Operation`] plus a direction marker for a request type.
macro_rules! operation {
    ($request:ty => $response:ty, $action:literal, $($marker:ident),+) => {
        impl $crate::messages::Operation for $request {
            const ACTION: &'static str = $action;
            type Response = $response;
        }
        $(impl $crate::messages::$marker for $request {})+
    };
}

mod common;
mod csms;
mod data_transfer;
mod station;

pub use common::*;
pub use csms::*;
pub use data_transfer::*;
pub use station::*;

/// A request payload together with its action name and response type.
pub trait Operation: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ACTION: &'static str;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Calls initiated by the CSMS and answered by a charging station.
pub trait CsmsOperation: Operation {}

/// Calls initiated by a charging station and answered by the CSMS.
pub trait StationOperation: Operation {}

/// Serde adapter for binary payload members, carried as base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
