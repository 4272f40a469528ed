use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raised when a stored or submitted string names no known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum persisted and serialized as a fixed string.
macro_rules! text_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    /// Caller role. Administrators bypass ownership checks.
    pub enum Role {
        Administrator => "ADMIN",
        Member => "USER",
    }
}

text_enum! {
    pub enum SignatureType {
        Electronic => "ELECTRONIC",
        Digital => "DIGITAL",
        Biometric => "BIOMETRIC",
    }
}

text_enum! {
    pub enum RequestStatus {
        Pending => "PENDING",
        Signed => "SIGNED",
        Expired => "EXPIRED",
        Cancelled => "CANCELLED",
    }
}

text_enum! {
    pub enum SignatureStatus {
        Valid => "VALID",
        Invalid => "INVALID",
        Error => "ERROR",
    }
}

text_enum! {
    pub enum VersionStatus {
        Draft => "DRAFT",
        PendingApproval => "PENDING_APPROVAL",
        Approved => "APPROVED",
        Rejected => "REJECTED",
    }
}

text_enum! {
    /// Whether applying a stamp also hashes and signs the stamped artifact.
    pub enum StampMode {
        StampOnly => "STAMP_ONLY",
        HashAndSign => "HASH_AND_SIGN",
    }
}

/// Authenticated caller identity, supplied by the upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Administrator
    }
}

/// Registry view of an uploaded document version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Key of the current canonical artifact.
    pub storage_key: String,
    /// Key of the upload as received. Never overwritten.
    pub original_storage_key: String,
    pub mime_type: String,
    pub status: VersionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureStamp {
    pub id: Uuid,
    pub name: String,
    pub image_ref: String,
    pub mime_type: String,
    pub is_active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub id: Uuid,
    pub document_version_id: Uuid,
    pub requester_id: Uuid,
    /// Designated approver, allowed to sign alongside the requester.
    pub approver_id: Option<Uuid>,
    pub signature_type: SignatureType,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signed_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub cancel_reason: Option<String>,
}

impl SignatureRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Typed metadata stored alongside a digital signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignatureData {
    StampApplied {
        stamp_id: Uuid,
        stamp_name: String,
        /// Present when the stamped artifact was also hashed and signed.
        algorithm: Option<String>,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
    },
    HashSigned {
        algorithm: String,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
    },
}

impl ToSql for SignatureData {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let json = serde_json::to_string(self)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(json))
    }
}

impl FromSql for SignatureData {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature {
    pub id: Uuid,
    pub document_version_id: Uuid,
    pub signer_id: Uuid,
    pub signature_stamp_id: Option<Uuid>,
    /// Hex SHA-256 of the artifact bytes at signing time.
    pub document_hash: Option<String>,
    /// Base64 RSA signature over `document_hash`.
    pub signature_hash: Option<String>,
    pub signature_status: SignatureStatus,
    pub signed_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub signature_data: SignatureData,
    /// Storage key of the exact artifact that was hashed.
    pub artifact_key: String,
}
