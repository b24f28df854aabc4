use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("URL is required")]
    MissingUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Link already exists: {0}")]
    DuplicateUrl(String),

    #[error("API key already in use")]
    DuplicateApiKey,

    #[error("Link not found")]
    LinkNotFound(u32),

    #[error("User not found")]
    UserIdNotFound(u32),

    #[error("API key required")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("token duration too big")]
    TokenDurationTooBig,

    #[error("{0}")]
    BadRequest(String),

    #[error("Route not found")]
    RouteNotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Internal server error")]
    Internal,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("jwt: {0:?}")]
    Jwt(jsonwebtoken::errors::ErrorKind),

    #[error("time: {0}")]
    Time(#[from] std::time::SystemTimeError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

// ErrorKind isn't an std error, so it can't be a thiserror source
impl From<jsonwebtoken::errors::ErrorKind> for Error {
    fn from(kind : jsonwebtoken::errors::ErrorKind) -> Self {
        Error::Jwt(kind)
    }
}

impl Error {
    /// Status code of the error class this error belongs to.
    pub fn status(&self) -> StatusCode {
        use Error::*;

        match self {
            MissingUrl | InvalidUrl(_) | BadRequest(_) => {
                StatusCode::BAD_REQUEST
            },
            DuplicateUrl(_) | DuplicateApiKey => StatusCode::CONFLICT,
            LinkNotFound(_) | RouteNotFound => StatusCode::NOT_FOUND,
            MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            // a session whose user vanished is as good as no session
            UserIdNotFound(_) | MissingApiKey | InvalidApiKey
            | Unauthorized | Jwt(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client.
    pub fn public_message(&self) -> String {
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR => Error::Internal.to_string(),
            StatusCode::UNAUTHORIZED => match self {
                Error::MissingApiKey | Error::InvalidApiKey => self.to_string(),
                _ => Error::Unauthorized.to_string(),
            },
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_status_codes() {
        assert_eq!(Error::MissingUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::InvalidUrl("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::DuplicateUrl("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(Error::LinkNotFound(1).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::InvalidApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::Jwt(jsonwebtoken::errors::ErrorKind::InvalidSignature)
                .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::Io(std::io::ErrorKind::Other.into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn jwt_kinds_convert() {
        let err : Error =
            jsonwebtoken::errors::ErrorKind::ExpiredSignature.into();

        assert!(matches!(
            err,
            Error::Jwt(jsonwebtoken::errors::ErrorKind::ExpiredSignature)
        ));
        assert_eq!(err.public_message(), "Unauthorized");
    }

    #[test]
    fn internal_details_stay_private() {
        let err = Error::Sqlite(rusqlite::Error::InvalidQuery);
        assert_eq!(err.public_message(), "Internal server error");

        let err = Error::UserIdNotFound(7);
        assert_eq!(err.public_message(), "Unauthorized");

        assert_eq!(Error::MissingApiKey.public_message(), "API key required");
    }
}
