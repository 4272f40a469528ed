use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::SealError;
use crate::model::{Actor, Role};

/// Set by the upstream authentication layer.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
/// Optional. Absent means an ordinary member.
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Pulls the caller identity forwarded by the authentication proxy, so every
/// handler can take an [`Actor`] argument.
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = SealError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_str(parts, ACTOR_ID_HEADER)?
            .ok_or_else(|| SealError::Unauthenticated(format!("{ACTOR_ID_HEADER} header is missing")))?
            .parse::<Uuid>()
            .map_err(|e| SealError::Unauthenticated(format!("{ACTOR_ID_HEADER} is not a UUID: {e}")))?;

        let role = match header_str(parts, ACTOR_ROLE_HEADER)? {
            Some(role) => role
                .to_ascii_uppercase()
                .parse::<Role>()
                .map_err(|e| SealError::Unauthenticated(e.to_string()))?,
            None => Role::Member,
        };

        Ok(Actor::new(user_id, role))
    }
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Result<Option<&'a str>, SealError> {
    parts
        .headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| SealError::Unauthenticated(format!("{name} header is not valid text")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(builder: axum::http::request::Builder) -> Result<Actor, SealError> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn member_by_default() {
        let id = Uuid::new_v4();
        let actor = extract(Request::builder().header(ACTOR_ID_HEADER, id.to_string()))
            .await
            .unwrap();
        assert_eq!(actor, Actor::new(id, Role::Member));
    }

    #[tokio::test]
    async fn admin_role_is_case_insensitive() {
        let actor = extract(
            Request::builder()
                .header(ACTOR_ID_HEADER, Uuid::new_v4().to_string())
                .header(ACTOR_ROLE_HEADER, "admin"),
        )
        .await
        .unwrap();
        assert!(actor.is_admin());
    }

    #[tokio::test]
    async fn missing_or_bad_identity_is_unauthenticated() {
        assert!(matches!(
            extract(Request::builder()).await,
            Err(SealError::Unauthenticated(_))
        ));
        assert!(matches!(
            extract(Request::builder().header(ACTOR_ID_HEADER, "alice")).await,
            Err(SealError::Unauthenticated(_))
        ));
        assert!(matches!(
            extract(
                Request::builder()
                    .header(ACTOR_ID_HEADER, Uuid::new_v4().to_string())
                    .header(ACTOR_ROLE_HEADER, "ROOT")
            )
            .await,
            Err(SealError::Unauthenticated(_))
        ));
    }
}
