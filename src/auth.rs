use crate::config::JwtConfig;
use crate::models::{Claims, TokenPair, TokenType, User};
use anyhow::{anyhow, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use sqlx::PgPool;
use uuid::Uuid;

pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiration_hours: i64,
    refresh_token_days: i64,
}

impl JwtAuth {
    pub fn new(config: &JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        let validation = Validation::default();

        Self {
            encoding_key,
            decoding_key,
            validation,
            expiration_hours: config.expiration_hours,
            refresh_token_days: config.refresh_token_days,
        }
    }

    fn generate_token(&self, user: &User, token_type: TokenType, lifetime_secs: i64) -> Result<String> {
        let now = Utc::now().timestamp();

        let claims = Claims {
            sub: user.username.clone(),
            user_id: user.id,
            user_type: user.user_type,
            token_type,
            exp: now + lifetime_secs,
            iat: now,
            jti: Uuid::new_v4(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Token generation failed: {}", e))
    }

    /// Short-lived bearer token for API calls.
    pub fn generate_access_token(&self, user: &User) -> Result<String> {
        self.generate_token(user, TokenType::Access, self.expiration_hours * 3600)
    }

    /// Long-lived token only accepted by the refresh endpoint.
    pub fn generate_refresh_token(&self, user: &User) -> Result<String> {
        self.generate_token(user, TokenType::Refresh, self.refresh_token_days * 86_400)
    }

    pub fn generate_pair(&self, user: &User) -> Result<TokenPair> {
        Ok(TokenPair {
            access: self.generate_access_token(user)?,
            refresh: self.generate_refresh_token(user)?,
        })
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| anyhow!("Token validation failed: {}", e))
    }

    /// Decode a token and require a specific type.
    pub fn validate_typed(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let claims = self.validate_token(token)?;
        if claims.token_type != expected {
            return Err(anyhow!("Expected {} token, got {}", expected, claims.token_type));
        }
        Ok(claims)
    }

    /// Check if a token is revoked (requires database check)
    pub async fn is_token_revoked(&self, jti: Uuid, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM revoked_tokens WHERE jti = $1 AND expires_at > now())"
        )
        .bind(jti)
        .fetch_one(pool)
        .await?;

        Ok(result)
    }

    /// Revoke a token (for logout). Revoking twice is a no-op.
    pub async fn revoke_token(&self, claims: &Claims, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "INSERT INTO revoked_tokens (jti, user_id, expires_at) VALUES ($1, $2, to_timestamp($3))
             ON CONFLICT (jti) DO NOTHING"
        )
        .bind(claims.jti)
        .bind(claims.user_id)
        .bind(claims.exp as f64)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Drop revocation rows whose tokens have expired anyway.
    pub async fn purge_expired_revocations(pool: &PgPool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= now()")
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(auth_header: Option<&str>) -> Result<String> {
    match auth_header {
        Some(header) if header.starts_with("Bearer ") => {
            Ok(header.trim_start_matches("Bearer ").trim().to_string())
        }
        _ => Err(anyhow!("Missing or invalid Authorization header")),
    }
}

/// Argon2id PHC string for a plaintext password.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("Password hashing failed: {}", e))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubscriptionTier, UserType};

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "test_secret_key_minimum_32_chars_long_for_security".to_string(),
            expiration_hours: 1,
            refresh_token_days: 7,
        }
    }

    fn test_user() -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: "drsmith".into(),
            email: "smith@example.com".into(),
            password_hash: String::new(),
            first_name: "Ann".into(),
            last_name: "Smith".into(),
            user_type: UserType::Provider,
            subscription_tier: SubscriptionTier::Premium,
            phone_number: String::new(),
            date_of_birth: None,
            patient_id: None,
            provider_id: None,
            language_preference: "en".into(),
            timezone: "UTC".into(),
            biometric_enabled: false,
            two_factor_enabled: false,
            is_verified: true,
            is_active: true,
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_token_generation_and_validation() {
        let auth = JwtAuth::new(&test_config());
        let user = test_user();

        let pair = auth.generate_pair(&user).expect("Token generation failed");
        let access = auth.validate_token(&pair.access).expect("Token validation failed");
        let refresh = auth.validate_token(&pair.refresh).expect("Token validation failed");

        assert_eq!(access.sub, "drsmith");
        assert_eq!(access.user_id, user.id);
        assert_eq!(access.user_type, UserType::Provider);
        assert_eq!(access.token_type, TokenType::Access);
        assert_eq!(refresh.token_type, TokenType::Refresh);
        assert_ne!(access.jti, refresh.jti);
        assert!(refresh.exp - access.exp > 6 * 86_400);
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let auth = JwtAuth::new(&test_config());
        let pair = auth.generate_pair(&test_user()).unwrap();

        assert!(auth.validate_typed(&pair.refresh, TokenType::Access).is_err());
        assert!(auth.validate_typed(&pair.access, TokenType::Access).is_ok());
    }

    #[test]
    fn test_invalid_token() {
        let auth = JwtAuth::new(&test_config());
        assert!(auth.validate_token("invalid.token.here").is_err());

        let other = JwtAuth::new(&JwtConfig {
            secret: "a_completely_different_secret_value_here".into(),
            ..test_config()
        });
        let token = other.generate_access_token(&test_user()).unwrap();
        assert!(auth.validate_token(&token).is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(extract_bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert!(extract_bearer_token(Some("Basic abc")).is_err());
        assert!(extract_bearer_token(None).is_err());
    }

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}
