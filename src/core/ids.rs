// src/core/ids.rs

//! Opaque identifiers for every entity in the data model.
//!
//! Each id wraps a `Uuid` rather than a bare database serial so that ids
//! remain stable across the wire protocol regardless of how the underlying
//! table stores its primary key.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(AccountId);
id_type!(ActorId);
id_type!(IdentityId);
id_type!(ClientId);
id_type!(MembershipId);
id_type!(GroupId);
id_type!(PolicyId);
id_type!(ResourceId);
id_type!(SiteId);
id_type!(ServingNodeId);
id_type!(RelayId);
id_type!(CredentialId);
id_type!(PolicyAuthorizationId);
