//! Phase token service.
//!
//! Tokens are signed HS256 envelopes carrying `{task_id, phase,
//! allowed_tools, exp}`. A token is the capability an agent presents on
//! every privileged call: the broker trusts the claims instead of doing a
//! state round-trip. Verification binds the token to a (task, phase) pair;
//! a successful phase transition therefore invalidates the old token by
//! construction, because its phase claim no longer matches.
//!
//! Every verification failure collapses to `false`. The concrete reason
//! (expired, tampered, wrong task, wrong phase, malformed) is logged at
//! debug level only, so clients cannot use the API as an oracle.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::TokenError;

/// Claims carried by a phase token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseClaims {
    pub task_id: String,
    pub phase: String,
    pub allowed_tools: Vec<String>,
    pub exp: i64,
}

/// Stateless issuer/verifier. Cheap to clone; no locking after startup.
#[derive(Debug, Clone)]
pub struct TokenService {
    secret: String,
    expiry_seconds: i64,
}

impl TokenService {
    pub fn new(secret: impl Into<String>, expiry_seconds: i64) -> Result<Self, TokenError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    pub fn expiry_seconds(&self) -> i64 {
        self.expiry_seconds
    }

    /// Issue a token binding `task_id` to `phase` with the given tool
    /// allow-list.
    pub fn issue(
        &self,
        task_id: &str,
        phase: &str,
        allowed_tools: &[String],
    ) -> Result<String, TokenError> {
        let claims = PhaseClaims {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            allowed_tools: allowed_tools.to_vec(),
            exp: chrono::Utc::now().timestamp() + self.expiry_seconds,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(TokenError::Encode)
    }

    /// Decode and signature-check a token, returning its claims.
    ///
    /// Expiry is enforced. Returns `None` on any failure.
    pub fn decode(&self, token: &str) -> Option<PhaseClaims> {
        match decode::<PhaseClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &self.validation(),
        ) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "phase token rejected");
                None
            }
        }
    }

    /// Verify a token against the expected (task, phase) binding.
    pub fn verify(&self, token: &str, task_id: &str, phase: &str) -> bool {
        let Some(claims) = self.decode(token) else {
            return false;
        };
        if claims.task_id != task_id {
            tracing::debug!(
                expected = task_id,
                presented = %claims.task_id,
                "phase token bound to different task"
            );
            return false;
        }
        if claims.phase != phase {
            tracing::debug!(
                expected = phase,
                presented = %claims.phase,
                "phase token bound to different phase"
            );
            return false;
        }
        true
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        // No leeway: an expired token must fail immediately, not within a
        // grace window.
        validation.leeway = 0;
        validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret_do_not_use_in_production_0123456789abcdef";

    fn service() -> TokenService {
        TokenService::new(SECRET, 7200).unwrap()
    }

    fn tools() -> Vec<String> {
        vec!["read_files".to_string(), "grep".to_string()]
    }

    #[test]
    fn empty_secret_is_rejected_at_construction() {
        assert!(matches!(
            TokenService::new("", 7200),
            Err(TokenError::EmptySecret)
        ));
    }

    #[test]
    fn round_trip_preserves_claims() {
        let svc = service();
        let token = svc.issue("task-123", "PLAN", &tools()).unwrap();
        let claims = svc.decode(&token).unwrap();
        assert_eq!(claims.task_id, "task-123");
        assert_eq!(claims.phase, "PLAN");
        assert_eq!(claims.allowed_tools, tools());
        assert!(claims.exp > chrono::Utc::now().timestamp());
    }

    #[test]
    fn verify_accepts_matching_binding() {
        let svc = service();
        let token = svc.issue("task-123", "PLAN", &tools()).unwrap();
        assert!(svc.verify(&token, "task-123", "PLAN"));
    }

    #[test]
    fn verify_rejects_wrong_task() {
        let svc = service();
        let token = svc.issue("task-123", "PLAN", &tools()).unwrap();
        assert!(!svc.verify(&token, "task-456", "PLAN"));
    }

    #[test]
    fn verify_rejects_wrong_phase() {
        let svc = service();
        let token = svc.issue("task-123", "PLAN", &tools()).unwrap();
        assert!(!svc.verify(&token, "task-123", "TDD"));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let svc = TokenService::new(SECRET, -60).unwrap();
        let token = svc.issue("task-123", "PLAN", &tools()).unwrap();
        assert!(!svc.verify(&token, "task-123", "PLAN"));
    }

    #[test]
    fn verify_rejects_tampered_token() {
        let svc = service();
        let token = svc.issue("task-123", "PLAN", &tools()).unwrap();
        // Flip a character in the payload segment.
        let mut chars: Vec<char> = token.chars().collect();
        let mid = token.len() / 2;
        chars[mid] = if chars[mid] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(!svc.verify(&tampered, "task-123", "PLAN"));
    }

    #[test]
    fn verify_rejects_token_signed_with_other_secret() {
        let svc = service();
        let other = TokenService::new("a_completely_different_secret_value", 7200).unwrap();
        let token = other.issue("task-123", "PLAN", &tools()).unwrap();
        assert!(!svc.verify(&token, "task-123", "PLAN"));
    }

    #[test]
    fn verify_rejects_garbage() {
        let svc = service();
        assert!(!svc.verify("not-a-jwt", "task-123", "PLAN"));
        assert!(!svc.verify("", "task-123", "PLAN"));
    }
}
