use std::time;

use jsonwebtoken as jwt;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const API_KEY_PREFIX : &str = "kiroku_";
const API_KEY_LEN : usize = 32;

/// A fresh random credential for the extension.
pub fn generate_api_key() -> String {
    let key : String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect();

    format!("{}{}", API_KEY_PREFIX, key)
}

/// Session token claims, minus the timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub iss :     String,
    pub aud :     String,
    pub sub :     String,
    pub version : u32,
}

#[derive(Serialize)]
struct SignedClaims<'a> {
    iss :     &'a str,
    aud :     &'a str,
    sub :     &'a str,
    version : u32,
    iat :     u64,
    exp :     u64,
}

#[derive(Deserialize)]
struct DecodedClaims {
    iss :     String,
    aud :     String,
    sub :     String,
    version : u32,
}

impl Token {
    pub fn for_user(server_name : &str, user : &crate::models::User) -> Self {
        Token {
            iss :     server_name.to_string(),
            aud :     server_name.to_string(),
            sub :     user.id.to_string(),
            version : user.token_version,
        }
    }

    pub fn issue(
        &self,
        secret : &[u8],
        ttl : time::Duration,
    ) -> Result<String> {
        let now = time::SystemTime::now();

        let iat = now.duration_since(time::UNIX_EPOCH)?.as_secs();

        let exp = now
            .checked_add(ttl)
            .ok_or(Error::TokenDurationTooBig)?
            .duration_since(time::UNIX_EPOCH)?
            .as_secs();

        let claims = SignedClaims {
            iss : &self.iss,
            aud : &self.aud,
            sub : &self.sub,
            version : self.version,
            iat,
            exp,
        };

        Ok(jwt::encode(
            &jwt::Header::default(),
            &claims,
            &jwt::EncodingKey::from_secret(secret),
        )
        .map_err(|err| err.into_kind())?)
    }

    /// Checks signature, expiry, issuer and audience.
    pub fn validate(token : &str, secret : &[u8], iss : &str) -> Result<Self> {
        let mut validation = jwt::Validation::new(jwt::Algorithm::HS256);
        validation.set_issuer(&[iss]);
        validation.set_audience(&[iss]);

        let claims : DecodedClaims = jwt::decode(
            token,
            &jwt::DecodingKey::from_secret(secret),
            &validation,
        )
        .map_err(|err| err.into_kind())?
        .claims;

        Ok(Self {
            iss :     claims.iss,
            aud :     claims.aud,
            sub :     claims.sub,
            version : claims.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET : &[u8] = b"0123456789abcdef0123456789abcdef";

    fn token() -> Token {
        Token {
            iss :     "links.test".into(),
            aud :     "links.test".into(),
            sub :     "42".into(),
            version : 3,
        }
    }

    #[test]
    fn issue_then_validate() {
        let s = token()
            .issue(SECRET, time::Duration::from_secs(60))
            .unwrap();

        assert_eq!(Token::validate(&s, SECRET, "links.test").unwrap(), token());
    }

    #[test]
    fn wrong_secret_or_issuer() {
        let s = token()
            .issue(SECRET, time::Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            Token::validate(&s, b"another-secret-another-secret!!!", "links.test"),
            Err(Error::Jwt(jwt::errors::ErrorKind::InvalidSignature))
        ));
        assert!(Token::validate(&s, SECRET, "elsewhere").is_err());
    }

    #[test]
    fn expired() {
        let mut tok = SignedClaims {
            iss :     "links.test",
            aud :     "links.test",
            sub :     "42",
            version : 0,
            iat :     0,
            exp :     0,
        };
        let now = time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        tok.iat = now - 7200;
        tok.exp = now - 3600;

        let s = jwt::encode(
            &jwt::Header::default(),
            &tok,
            &jwt::EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert!(matches!(
            Token::validate(&s, SECRET, "links.test"),
            Err(Error::Jwt(jwt::errors::ErrorKind::ExpiredSignature))
        ));
    }

    #[test]
    fn api_key_shape() {
        let a = generate_api_key();
        let b = generate_api_key();

        assert!(a.starts_with(API_KEY_PREFIX));
        assert_eq!(a.len(), API_KEY_PREFIX.len() + API_KEY_LEN);
        assert!(a[API_KEY_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
