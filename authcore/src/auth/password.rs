//! Password hashing, verification and strength rules.
//!
//! Digests are argon2id PHC strings computed over `plaintext || pepper`. The PHC string
//! embeds algorithm, version and cost, so verification always uses the parameters the
//! digest was created with, even after the configured cost changes.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        rand_core::{OsRng, RngCore},
    },
};
use base64::{Engine as _, engine::general_purpose};
use serde::Serialize;
use std::{collections::HashSet, fmt, sync::Arc};
use utoipa::ToSchema;

use crate::config::{PLACEHOLDER_PEPPER, PasswordConfig};
use crate::errors::{Error, FieldErrors};

/// Argon2 hashing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    fn to_argon2(self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| PasswordError::Hashing(format!("invalid argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl From<&PasswordConfig> for Argon2Params {
    fn from(config: &PasswordConfig) -> Self {
        Self {
            memory_kib: config.argon2_memory_kib,
            iterations: config.argon2_iterations,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// A strength rule a candidate password can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PasswordRule {
    TooShort,
    TooLong,
    MissingLowercase,
    MissingUppercase,
    MissingDigit,
    MissingSymbol,
    Common,
    MatchesIdentity,
}

impl PasswordRule {
    pub fn as_str(self) -> &'static str {
        match self {
            PasswordRule::TooShort => "too_short",
            PasswordRule::TooLong => "too_long",
            PasswordRule::MissingLowercase => "missing_lowercase",
            PasswordRule::MissingUppercase => "missing_uppercase",
            PasswordRule::MissingDigit => "missing_digit",
            PasswordRule::MissingSymbol => "missing_symbol",
            PasswordRule::Common => "common_password",
            PasswordRule::MatchesIdentity => "matches_identity",
        }
    }
}

impl fmt::Display for PasswordRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    /// Every rule the candidate failed, in evaluation order
    #[error("password does not meet strength requirements: {failures:?}")]
    WeakPassword { failures: Vec<PasswordRule> },

    #[error("secure random source unavailable: {0}")]
    RandomnessUnavailable(String),

    #[error("password pepper is missing or still the placeholder")]
    MisconfiguredPepper,

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

impl PasswordError {
    /// Convert a strength failure into a validation error on `field`.
    pub fn into_field_error(self, field: &str) -> Error {
        match self {
            PasswordError::WeakPassword { failures } => {
                let mut details = FieldErrors::new();
                details.insert(field.to_string(), failures.iter().map(|r| r.as_str().to_string()).collect());
                Error::Validation {
                    message: "Password does not meet strength requirements".to_string(),
                    details,
                }
            }
            other => other.into(),
        }
    }
}

impl From<PasswordError> for Error {
    fn from(err: PasswordError) -> Self {
        match err {
            weak @ PasswordError::WeakPassword { .. } => weak.into_field_error("password"),
            PasswordError::RandomnessUnavailable(e) => Error::Internal {
                operation: format!("read OS randomness: {e}"),
            },
            PasswordError::MisconfiguredPepper => Error::Internal {
                operation: "load password pepper".to_string(),
            },
            PasswordError::Hashing(e) => Error::Internal {
                operation: format!("hash password: {e}"),
            },
        }
    }
}

/// Identity fields a password must not repeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordContext<'a> {
    pub email: Option<&'a str>,
    pub username: Option<&'a str>,
}

/// Frequently breached passwords, refused regardless of composition.
const COMMON_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "password123",
    "p@ssw0rd",
    "p@ssword1",
    "passw0rd!",
    "123456",
    "12345678",
    "123456789",
    "1234567890",
    "qwerty",
    "qwerty123",
    "qwerty123!",
    "abc123",
    "abcd1234",
    "111111",
    "000000",
    "letmein",
    "letmein1!",
    "welcome",
    "welcome1",
    "welcome1!",
    "welcome123",
    "admin",
    "admin123",
    "admin@123",
    "administrator",
    "iloveyou",
    "monkey",
    "dragon",
    "sunshine",
    "princess",
    "football",
    "baseball",
    "master",
    "changeme",
    "changeme1!",
    "trustno1",
    "summer2024!",
    "winter2024!",
    "spring2024!",
    "autumn2024!",
    "secret123",
    "zaq1@wsx",
    "1q2w3e4r",
    "1qaz2wsx",
];

/// Hashes and checks passwords for one deployment.
///
/// Cheap to clone; hashing state is shared.
#[derive(Clone)]
pub struct PasswordService {
    inner: Arc<Inner>,
}

struct Inner {
    pepper: String,
    params: Argon2Params,
    min_length: usize,
    max_length: usize,
    blocklist: HashSet<String>,
    /// Digest verified against when no subject exists, so that path costs a full verification
    dummy_digest: String,
}

impl fmt::Debug for PasswordService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordService")
            .field("params", &self.inner.params)
            .field("min_length", &self.inner.min_length)
            .field("max_length", &self.inner.max_length)
            .finish_non_exhaustive()
    }
}

impl PasswordService {
    pub fn new(config: &PasswordConfig) -> Result<Self, PasswordError> {
        if config.pepper.is_empty() || config.pepper == PLACEHOLDER_PEPPER {
            return Err(PasswordError::MisconfiguredPepper);
        }
        let params = Argon2Params::from(config);
        // Fail at startup rather than on the first login
        params.to_argon2()?;

        let blocklist = COMMON_PASSWORDS
            .iter()
            .map(|p| p.to_string())
            .chain(config.blocklist.iter().map(|p| p.to_lowercase()))
            .collect();

        let mut inner = Inner {
            pepper: config.pepper.clone(),
            params,
            min_length: config.min_length.max(8),
            max_length: config.max_length,
            blocklist,
            dummy_digest: String::new(),
        };
        let mut filler = [0u8; 24];
        try_fill(&mut filler)?;
        inner.dummy_digest = hash_with(&inner, &general_purpose::URL_SAFE_NO_PAD.encode(filler))?;

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Hash a plaintext password. CPU heavy: call from a blocking context.
    pub fn hash(&self, plaintext: &str) -> Result<String, PasswordError> {
        hash_with(&self.inner, plaintext)
    }

    /// Check `plaintext` against `digest`. A digest that does not parse never matches.
    pub fn verify(&self, plaintext: &str, digest: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(digest) else {
            tracing::warn!("Stored password digest is not a valid PHC string");
            return false;
        };
        Argon2::default()
            .verify_password(peppered(plaintext, &self.inner.pepper).as_bytes(), &parsed)
            .is_ok()
    }

    /// Spend the same work as a real verification when there is nothing to verify against.
    pub fn verify_dummy(&self, plaintext: &str) {
        let _ = self.verify(plaintext, &self.inner.dummy_digest);
    }

    /// Hash on the blocking pool.
    pub async fn hash_async(&self, plaintext: String) -> Result<String, PasswordError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.hash(&plaintext))
            .await
            .map_err(|e| PasswordError::Hashing(format!("hashing task failed: {e}")))?
    }

    /// Verify on the blocking pool. `None` digest runs the dummy verification and returns false.
    ///
    /// A verification task that panicked or was cancelled is an error, not a mismatch.
    pub async fn verify_async(&self, plaintext: String, digest: Option<String>) -> Result<bool, PasswordError> {
        let service = self.clone();
        let verdict = tokio::task::spawn_blocking(move || match digest {
            Some(digest) => service.verify(&plaintext, &digest),
            None => {
                service.verify_dummy(&plaintext);
                false
            }
        })
        .await;
        joined_verdict(verdict)
    }

    /// Check every strength rule and report all failures.
    pub fn validate(&self, plaintext: &str, context: Option<PasswordContext<'_>>) -> Result<(), PasswordError> {
        let mut failures = Vec::new();
        let length = plaintext.chars().count();

        if length < self.inner.min_length {
            failures.push(PasswordRule::TooShort);
        }
        if length > self.inner.max_length {
            failures.push(PasswordRule::TooLong);
        }
        if !plaintext.chars().any(char::is_lowercase) {
            failures.push(PasswordRule::MissingLowercase);
        }
        if !plaintext.chars().any(char::is_uppercase) {
            failures.push(PasswordRule::MissingUppercase);
        }
        if !plaintext.chars().any(|c| c.is_ascii_digit()) {
            failures.push(PasswordRule::MissingDigit);
        }
        if !plaintext.chars().any(|c| !c.is_alphanumeric()) {
            failures.push(PasswordRule::MissingSymbol);
        }

        let lowered = plaintext.to_lowercase();
        if self.inner.blocklist.contains(&lowered) {
            failures.push(PasswordRule::Common);
        }

        if let Some(context) = context {
            let matches = |candidate: Option<&str>| candidate.is_some_and(|c| !c.is_empty() && c.to_lowercase() == lowered);
            let local_part = context.email.and_then(|e| e.split_once('@')).map(|(local, _)| local);
            if matches(context.email) || matches(context.username) || matches(local_part) {
                failures.push(PasswordRule::MatchesIdentity);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PasswordError::WeakPassword { failures })
        }
    }

    /// Generate a random password of `length` characters that satisfies every rule.
    pub fn generate_secure(&self, length: usize) -> Result<String, PasswordError> {
        const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
        const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
        const DIGITS: &[u8] = b"23456789";
        const SYMBOLS: &[u8] = b"!@#$%^&*-_=+?";
        const CLASSES: [&[u8]; 4] = [LOWER, UPPER, DIGITS, SYMBOLS];

        let length = length.clamp(self.inner.min_length, self.inner.max_length.max(self.inner.min_length));
        let all: Vec<u8> = CLASSES.concat();
        let mut random = vec![0u8; length * 2];
        try_fill(&mut random)?;

        // One character from each class, the rest from the full alphabet
        let mut chars: Vec<u8> = CLASSES
            .iter()
            .zip(&random)
            .map(|(class, r)| class[*r as usize % class.len()])
            .collect();
        chars.extend(random[CLASSES.len()..length].iter().map(|r| all[*r as usize % all.len()]));

        // Fisher-Yates with the remaining random bytes, so the class characters don't sit up front
        for (i, r) in (1..chars.len()).rev().zip(&random[length..]) {
            chars.swap(i, *r as usize % (i + 1));
        }

        String::from_utf8(chars).map_err(|e| PasswordError::Hashing(e.to_string()))
    }

    /// 32 random bytes, URL-safe base64 without padding (43 characters).
    pub fn mint_reset_token(&self) -> Result<String, PasswordError> {
        mint_opaque_token()
    }
}

/// 256-bit opaque token from the OS random source.
pub fn mint_opaque_token() -> Result<String, PasswordError> {
    let mut bytes = [0u8; 32];
    try_fill(&mut bytes)?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn try_fill(buf: &mut [u8]) -> Result<(), PasswordError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| PasswordError::RandomnessUnavailable(e.to_string()))
}

fn peppered(plaintext: &str, pepper: &str) -> String {
    let mut input = String::with_capacity(plaintext.len() + pepper.len());
    input.push_str(plaintext);
    input.push_str(pepper);
    input
}

fn hash_with(inner: &Inner, plaintext: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = inner.params.to_argon2()?;
    let hash = argon2
        .hash_password(peppered(plaintext, &inner.pepper).as_bytes(), &salt)
        .map_err(|e| PasswordError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

fn joined_verdict(verdict: Result<bool, tokio::task::JoinError>) -> Result<bool, PasswordError> {
    verdict.map_err(|e| PasswordError::Hashing(format!("verification task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn cheap_config() -> PasswordConfig {
        PasswordConfig {
            pepper: "test-pepper".to_string(),
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            ..PasswordConfig::default()
        }
    }

    fn service() -> PasswordService {
        PasswordService::new(&cheap_config()).unwrap()
    }

    fn failures(result: Result<(), PasswordError>) -> Vec<PasswordRule> {
        match result {
            Err(PasswordError::WeakPassword { failures }) => failures,
            other => panic!("expected weak password, got {other:?}"),
        }
    }

    #[test]
    fn test_refuses_placeholder_pepper() {
        let mut config = cheap_config();
        config.pepper = PLACEHOLDER_PEPPER.to_string();
        assert!(matches!(PasswordService::new(&config), Err(PasswordError::MisconfiguredPepper)));

        config.pepper = String::new();
        assert!(matches!(PasswordService::new(&config), Err(PasswordError::MisconfiguredPepper)));
    }

    #[test]
    fn test_hash_verify_round_trip() {
        let passwords = service();
        let digest = passwords.hash("P@ssw0rd!").unwrap();

        assert!(digest.starts_with("$argon2id$v=19$m=1024,t=1,p=1$"));
        assert!(passwords.verify("P@ssw0rd!", &digest));
        assert!(!passwords.verify("P@ssw0rd?", &digest));
        assert!(!passwords.verify("P@ssw0rd!", "not-a-phc-string"));
    }

    #[test]
    fn test_same_password_different_salts() {
        let passwords = service();
        let a = passwords.hash("P@ssw0rd!").unwrap();
        let b = passwords.hash("P@ssw0rd!").unwrap();
        assert_ne!(a, b);
        assert!(passwords.verify("P@ssw0rd!", &a));
        assert!(passwords.verify("P@ssw0rd!", &b));
    }

    #[test]
    fn test_pepper_is_part_of_the_digest() {
        let passwords = service();
        let digest = passwords.hash("P@ssw0rd!").unwrap();

        let mut other = cheap_config();
        other.pepper = "different-pepper".to_string();
        let other = PasswordService::new(&other).unwrap();
        assert!(!other.verify("P@ssw0rd!", &digest));
    }

    #[test]
    fn test_verification_uses_embedded_params() {
        let weak = service();
        let digest = weak.hash("P@ssw0rd!").unwrap();

        let mut stronger = cheap_config();
        stronger.argon2_iterations = 3;
        let stronger = PasswordService::new(&stronger).unwrap();
        assert!(stronger.verify("P@ssw0rd!", &digest));
    }

    #[tokio::test]
    async fn test_async_helpers() {
        let passwords = service();
        let digest = passwords.hash_async("P@ssw0rd!".to_string()).await.unwrap();
        assert!(passwords.verify_async("P@ssw0rd!".to_string(), Some(digest)).await.unwrap());
        assert!(!passwords.verify_async("P@ssw0rd!".to_string(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_verification_task_is_an_error() {
        let panicked = tokio::task::spawn_blocking(|| -> bool { panic!("verifier crashed") }).await;
        assert!(matches!(joined_verdict(panicked), Err(PasswordError::Hashing(_))));
        assert!(matches!(joined_verdict(Ok(false)), Ok(false)));
    }

    #[test]
    fn test_strong_password_passes() {
        assert!(service().validate("P@ssw0rd!x", None).is_ok());
        assert!(service().validate("N3wP@ss!", None).is_ok());
    }

    #[test]
    fn test_reports_every_failed_rule() {
        let passwords = service();
        assert_eq!(
            failures(passwords.validate("abc", None)),
            vec![
                PasswordRule::TooShort,
                PasswordRule::MissingUppercase,
                PasswordRule::MissingDigit,
                PasswordRule::MissingSymbol,
            ]
        );
        assert_eq!(
            failures(passwords.validate("ALLUPPERCASE1!", None)),
            vec![PasswordRule::MissingLowercase]
        );
        assert_eq!(failures(passwords.validate("Other1!", None)), vec![PasswordRule::TooShort]);
    }

    #[test]
    fn test_blocklist_is_case_insensitive() {
        let passwords = service();
        assert_eq!(failures(passwords.validate("P@ssw0rd", None)), vec![PasswordRule::Common]);

        let mut config = cheap_config();
        config.blocklist = vec!["Corp2024!Secret".to_string()];
        let passwords = PasswordService::new(&config).unwrap();
        assert_eq!(failures(passwords.validate("corp2024!SECRET", None)), vec![PasswordRule::Common]);
    }

    #[test]
    fn test_password_must_not_match_identity() {
        let passwords = service();
        let context = PasswordContext {
            email: Some("Str0ng!User@example.com"),
            username: Some("Str0ng!Name"),
        };
        assert_eq!(
            failures(passwords.validate("str0ng!name", Some(context))),
            vec![PasswordRule::MissingUppercase, PasswordRule::MatchesIdentity]
        );
        assert_eq!(
            failures(passwords.validate("Str0ng!User", Some(context))),
            vec![PasswordRule::MatchesIdentity]
        );
        assert!(passwords.validate("Str0ng!Other", Some(context)).is_ok());
    }

    #[test]
    fn test_max_length() {
        let passwords = service();
        let long = format!("Aa1!{}", "x".repeat(200));
        assert_eq!(failures(passwords.validate(&long, None)), vec![PasswordRule::TooLong]);
    }

    #[test]
    fn test_generate_secure_passes_validation() {
        let passwords = service();
        for _ in 0..20 {
            let generated = passwords.generate_secure(16).unwrap();
            assert_eq!(generated.chars().count(), 16);
            assert!(passwords.validate(&generated, None).is_ok(), "{generated}");
        }
        // Requests below the minimum are raised to it
        assert_eq!(passwords.generate_secure(4).unwrap().len(), 8);
    }

    #[test]
    fn test_reset_tokens_are_url_safe_and_unique() {
        let passwords = service();
        let a = passwords.mint_reset_token().unwrap();
        let b = passwords.mint_reset_token().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_weak_password_maps_to_validation_details() {
        let err = PasswordError::WeakPassword {
            failures: vec![PasswordRule::TooShort, PasswordRule::MissingDigit],
        }
        .into_field_error("new_password");
        let body = err.body();
        assert_eq!(body.code, "VALIDATION_ERROR");
        assert_eq!(
            body.details.unwrap()["new_password"],
            vec!["too_short".to_string(), "missing_digit".to_string()]
        );
    }
}
