use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Invalid Authorization scheme")]
    InvalidScheme,
    #[error("Missing token")]
    MissingToken,
    #[error("Invalid JWT")]
    InvalidToken,
    #[error("Invalid JWT payload")]
    InvalidPayload,
    #[error("Forbidden for role")]
    Forbidden,
}

/// Bearer token claims. The signature is not verified: the dashboard trusts
/// the gateway in front of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn from_authorization(header: Option<&str>) -> Result<Self, AuthError> {
        let header = header.ok_or(AuthError::MissingHeader)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidScheme)?
            .trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Self::decode(token)
    }

    fn decode(token: &str) -> Result<Self, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::InvalidToken);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(parts[1].trim_end_matches('='))
            .map_err(|_| AuthError::InvalidPayload)?;
        match serde_json::from_slice(&raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            _ => Err(AuthError::InvalidPayload),
        }
    }

    /// A claim rendered as text; numbers are accepted for identifiers.
    pub fn get(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The first populated claim among `names`.
    pub fn first_of(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| self.get(name))
    }

    pub fn role(&self) -> String {
        self.get("role").unwrap_or_default().to_lowercase()
    }

    pub fn require_role(&self, expected: &str) -> Result<(), AuthError> {
        if self.role() == expected.to_lowercase() {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

#[cfg(test)]
pub(crate) fn bearer(payload: &Value) -> String {
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("Bearer eyJhbGciOiJub25lIn0.{}.sig", body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_payload_claims() {
        let header = bearer(&json!({"role": "Agent", "agent_id": 42}));
        let claims = Claims::from_authorization(Some(&header)).unwrap();
        assert_eq!(claims.role(), "agent");
        assert_eq!(claims.first_of(&["agent_id", "sub"]), Some("42".to_string()));
        assert!(claims.require_role("agent").is_ok());
        assert_eq!(claims.require_role("hr"), Err(AuthError::Forbidden));
    }

    #[test]
    fn test_rejects_malformed_headers() {
        assert_eq!(Claims::from_authorization(None), Err(AuthError::MissingHeader));
        assert_eq!(
            Claims::from_authorization(Some("Basic abc")),
            Err(AuthError::InvalidScheme)
        );
        assert_eq!(
            Claims::from_authorization(Some("Bearer   ")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            Claims::from_authorization(Some("Bearer a.b")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            Claims::from_authorization(Some("Bearer a.!!!.c")),
            Err(AuthError::InvalidPayload)
        );
        let list = format!("Bearer a.{}.c", URL_SAFE_NO_PAD.encode("[1]"));
        assert_eq!(
            Claims::from_authorization(Some(&list)),
            Err(AuthError::InvalidPayload)
        );
    }
}
