use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::Identity;
use crate::services::IdentityService;
use crate::AppState;

/// Pull the token out of `Authorization: bearer <token>`. The scheme is
/// matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
}

/// Operator auth: resolve the bearer token to an identity and stash it in
/// the request extensions. Token failures keep their classification; a
/// subject that no longer resolves is forbidden.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| AppError::Forbidden("missing bearer token".into()))?;

    let verified = state.tokens.verify(token).await?;

    let identity = state
        .identities
        .get_identity(&verified.subject)
        .await?
        .ok_or_else(|| AppError::Forbidden("token subject no longer exists".into()))?;

    req.extensions_mut().insert(CurrentIdentity(identity));
    Ok(next.run(req).await)
}

/// The authenticated operator, extracted from request extensions.
#[derive(Clone)]
pub struct CurrentIdentity(pub Identity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentIdentity>()
            .cloned()
            .ok_or_else(|| AppError::Forbidden("request is not authenticated".into()))
    }
}

/// Route guard: the caller's function list must contain `function`.
pub fn require(identity: &Identity, function: &str) -> Result<(), AppError> {
    if IdentityService::allow_access(identity, function) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "requires function {function}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(
            bearer_token(&headers_with("bearer abc.def")),
            Some("abc.def")
        );
        assert_eq!(
            bearer_token(&headers_with("Bearer abc.def")),
            Some("abc.def")
        );
        assert_eq!(bearer_token(&headers_with("Basic abc")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn require_checks_the_function_list() {
        let identity = Identity::new(
            "op".into(),
            "auth-1".into(),
            vec!["identity.get.all".into()],
        );
        assert!(require(&identity, "identity.get.all").is_ok());
        assert!(require(&identity, "identity.create").is_err());
    }
}
