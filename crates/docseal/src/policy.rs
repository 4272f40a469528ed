//! Authorization rules for every mutating operation.

use crate::error::SealError;
use crate::model::{Actor, SignatureRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    CreateRequest,
    ApplyStamp,
    Sign,
    Cancel,
    Revoke,
    ManageStamps,
    SweepExpired,
}

#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// A document version with no pending request attached.
    Version,
    Request(&'a SignatureRequest),
    Stamps,
    Requests,
}

/// Administrators may do anything. Everyone else may read, open requests and
/// stamp unclaimed versions; signing a request is reserved to its requester
/// and designated approver, cancelling and revoking to the requester.
pub fn can_act(actor: &Actor, resource: &Resource<'_>, action: Action) -> bool {
    if actor.is_admin() {
        return true;
    }
    match (action, resource) {
        (Action::Read, _) => true,
        (Action::CreateRequest | Action::ApplyStamp, Resource::Version) => true,
        (Action::Sign | Action::ApplyStamp, Resource::Request(request)) => {
            request.requester_id == actor.user_id || request.approver_id == Some(actor.user_id)
        }
        (Action::Cancel | Action::Revoke, Resource::Request(request)) => {
            request.requester_id == actor.user_id
        }
        _ => false,
    }
}

pub fn ensure(actor: &Actor, resource: &Resource<'_>, action: Action) -> Result<(), SealError> {
    if can_act(actor, resource, action) {
        Ok(())
    } else {
        Err(SealError::PermissionDenied(format!(
            "user {} may not {action:?} this {}",
            actor.user_id,
            resource.describe()
        )))
    }
}

impl Resource<'_> {
    fn describe(&self) -> &'static str {
        match self {
            Resource::Version => "document version",
            Resource::Request(_) => "signature request",
            Resource::Stamps => "stamp catalogue",
            Resource::Requests => "request set",
        }
    }
}
