//! JWT authentication.
//!
//! [`JwtAuth`] is an [`Interceptor`] that reads a token from the
//! `authorization` metadata entry, verifies it with a key chosen by a
//! [`KeyResolver`], and stores the parsed [`JwtToken`] in the request
//! extensions. Every failure is reported to the client as the same
//! `UNAUTHENTICATED` status so callers cannot learn why a token was refused.

use crate::interceptor::Interceptor;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, Validation, decode, decode_header,
    errors::{Error as JwtError, ErrorKind},
};
use std::{collections::HashSet, fmt, sync::Arc};
use tonic::{Request, Status};

/// Metadata key the token is read from.
pub const AUTHORIZATION: &str = "authorization";

/// Decoded JWT claims.
pub type Claims = serde_json::Map<String, serde_json::Value>;

/// A verified token, available to handlers through the request extensions.
#[derive(Debug, Clone)]
pub struct JwtToken {
    raw: String,
    header: Header,
    claims: Claims,
}

impl JwtToken {
    /// The token exactly as sent, without any `Bearer ` prefix.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The `sub` claim, when it is a string.
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(serde_json::Value::as_str)
    }
}

/// Chooses the key a token is verified with, based on its header.
///
/// Returning an error (e.g. for an unexpected `alg` or unknown `kid`) rejects
/// the token.
pub trait KeyResolver: Send + Sync + 'static {
    fn resolve(&self, header: &Header) -> Result<DecodingKey, JwtError>;
}

impl<F> KeyResolver for F
where
    F: Fn(&Header) -> Result<DecodingKey, JwtError> + Send + Sync + 'static,
{
    fn resolve(&self, header: &Header) -> Result<DecodingKey, JwtError> {
        self(header)
    }
}

/// Resolver for a shared HMAC secret. Only `HS256`, `HS384` and `HS512`
/// tokens are accepted.
pub fn hmac_secret(secret: impl AsRef<[u8]>) -> impl KeyResolver {
    let key = DecodingKey::from_secret(secret.as_ref());
    move |header: &Header| match header.alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(key.clone()),
        _ => Err(JwtError::from(ErrorKind::InvalidAlgorithm)),
    }
}

/// Interceptor verifying JWTs on the configured methods.
#[derive(Clone)]
pub struct JwtAuth {
    resolver: Arc<dyn KeyResolver>,
    methods: Arc<HashSet<String>>,
}

impl JwtAuth {
    /// `methods` lists the full method paths (`/package.Service/Method`) that
    /// require a token. An empty list protects every method.
    pub fn new<I, M>(resolver: impl KeyResolver, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        Self {
            resolver: Arc::new(resolver),
            methods: Arc::new(methods.into_iter().map(Into::into).collect()),
        }
    }

    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Verifies the signature of `raw`. `exp` and `nbf` are checked when
    /// present, without leeway; no claim is required.
    pub fn verify(&self, raw: &str) -> Result<JwtToken, JwtError> {
        let header = decode_header(raw)?;
        let key = self.resolver.resolve(&header)?;

        let mut validation = Validation::new(header.alg);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.leeway = 0;

        let data = decode::<Claims>(raw, &key, &validation)?;
        Ok(JwtToken {
            raw: raw.to_owned(),
            header: data.header,
            claims: data.claims,
        })
    }

    fn authenticate<T>(&self, request: &Request<T>) -> Result<JwtToken, Status> {
        let Some(raw) = request
            .metadata()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(strip_bearer)
            .filter(|raw| !raw.is_empty())
        else {
            tracing::debug!("authorization token not found in metadata");
            return Err(unauthenticated());
        };

        self.verify(raw).map_err(|err| {
            tracing::warn!(error = %err, "failed to validate token");
            unauthenticated()
        })
    }
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth")
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl Interceptor for JwtAuth {
    fn intercept(&self, method: &str, mut request: Request<()>) -> Result<Request<()>, Status> {
        if !self.applies_to(method) {
            return Ok(request);
        }
        let token = self.authenticate(&request)?;
        request.extensions_mut().insert(token);
        Ok(request)
    }
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => value,
    }
}

fn unauthenticated() -> Status {
    Status::unauthenticated("unauthenticated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, encode};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tonic::Code;

    const SECRET: &[u8] = b"grpcapp-test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn request(authorization: Option<&str>) -> Request<()> {
        let mut request = Request::new(());
        if let Some(value) = authorization {
            request
                .metadata_mut()
                .insert(AUTHORIZATION, value.parse().unwrap());
        }
        request
    }

    fn auth(methods: &[&str]) -> JwtAuth {
        JwtAuth::new(hmac_secret(SECRET), methods.iter().copied())
    }

    fn assert_unauthenticated(result: Result<Request<()>, Status>) {
        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert_eq!(status.message(), "unauthenticated");
    }

    #[test]
    fn accepts_valid_token_and_stores_claims() {
        let raw = token(json!({ "sub": "alice", "exp": now() + 60 }));
        let request = auth(&[])
            .intercept("/pkg.Svc/Call", request(Some(&raw)))
            .unwrap();

        let stored = request.extensions().get::<JwtToken>().unwrap();
        assert_eq!(stored.raw(), raw);
        assert_eq!(stored.subject(), Some("alice"));
        assert_eq!(stored.header().alg, Algorithm::HS256);
    }

    #[test]
    fn strips_bearer_prefix() {
        let raw = token(json!({ "sub": "bob" }));
        let request = auth(&[])
            .intercept("/pkg.Svc/Call", request(Some(&format!("Bearer {raw}"))))
            .unwrap();
        assert_eq!(request.extensions().get::<JwtToken>().unwrap().raw(), raw);
    }

    #[test]
    fn every_failure_is_the_same_status() {
        let auth = auth(&[]);
        let wrong_key = encode(
            &Header::default(),
            &json!({ "sub": "mallory" }),
            &EncodingKey::from_secret(b"another-secret"),
        )
        .unwrap();
        let expired = token(json!({ "sub": "carol", "exp": now() - 3600 }));
        let not_yet = token(json!({ "sub": "dave", "nbf": now() + 3600 }));

        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(None)));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(Some(""))));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(Some("Bearer "))));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(Some("not-a-jwt"))));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(Some(&wrong_key))));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(Some(&expired))));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Call", request(Some(&not_yet))));
    }

    #[test]
    fn expiry_has_no_leeway() {
        let auth = auth(&[]);
        let just_expired = token(json!({ "sub": "frank", "exp": now() - 5 }));
        let almost_valid = token(json!({ "sub": "grace", "nbf": now() + 5 }));

        assert!(auth.verify(&just_expired).is_err());
        assert!(auth.verify(&almost_valid).is_err());
        assert!(auth.verify(&token(json!({ "exp": now() + 30 }))).is_ok());
    }

    #[test]
    fn resolver_can_refuse_algorithm() {
        let raw = encode(
            &Header::new(Algorithm::HS512),
            &json!({ "sub": "erin" }),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        let only_hs256 = JwtAuth::new(
            |header: &Header| {
                if header.alg == Algorithm::HS256 {
                    Ok(DecodingKey::from_secret(SECRET))
                } else {
                    Err(JwtError::from(ErrorKind::InvalidAlgorithm))
                }
            },
            Vec::<String>::new(),
        );
        assert_unauthenticated(only_hs256.intercept("/pkg.Svc/Call", request(Some(&raw))));
        assert!(auth(&[]).verify(&raw).is_ok());
    }

    #[test]
    fn unlisted_methods_bypass_authentication() {
        let auth = auth(&["/pkg.Svc/Protected"]);
        let mut untouched = request(None);
        untouched.extensions_mut().insert(42u32);

        let passed = auth.intercept("/pkg.Svc/Public", untouched).unwrap();
        assert_eq!(passed.extensions().get::<u32>(), Some(&42));
        assert!(passed.extensions().get::<JwtToken>().is_none());

        assert_unauthenticated(auth.intercept("/pkg.Svc/Protected", request(None)));
    }

    #[test]
    fn empty_allow_list_protects_everything() {
        let auth = auth(&[]);
        assert!(auth.applies_to("/pkg.Svc/Anything"));
        assert_unauthenticated(auth.intercept("/pkg.Svc/Anything", request(None)));
    }
}
