use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cookie::{Cookie, SameSite};
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use warp::filters::body::BodyDeserializeError;
use warp::filters::method;
use warp::reject::{
    InvalidQuery, LengthRequired, MethodNotAllowed, PayloadTooLarge, Reject,
    UnsupportedMediaType,
};
use warp::reply::{self, Response};
use warp::{filters, Filter, Rejection, Reply};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::{crypto, database, models, sync};

pub const COOKIE_NAME : &str = "kiroku-token";
pub const API_KEY_HEADER : &str = "x-api-key";

const MAX_BODY : u64 = 1024 * 1024;
const API_KEY_ATTEMPTS : usize = 3;

pub struct ServerInner {
    pub server_name :  String,
    pub token_secret : Vec<u8>,
    pub session_ttl :  Duration,
    pub db :           database::Db,
}

pub type Server = Arc<ServerInner>;

impl ServerInner {
    pub fn new(config : &Config, db : database::Db) -> Server {
        Arc::new(ServerInner {
            server_name : config.server_name.clone(),
            token_secret : config.token_secret.clone(),
            session_ttl : config.session_ttl,
            db,
        })
    }

    /// Signs a session token for `user`.
    pub fn issue_session(&self, user : &models::User) -> Result<String> {
        crypto::Token::for_user(&self.server_name, user)
            .issue(&self.token_secret, self.session_ttl)
    }

    async fn authenticate_session(
        &self,
        cookie : Option<String>,
        authorization : Option<String>,
    ) -> Result<models::User> {
        let bearer = authorization.as_deref().and_then(|h| {
            h.strip_prefix("Bearer ").map(|s| s.trim().to_string())
        });

        let value = bearer.or(cookie).ok_or(Error::Unauthorized)?;

        let tok = crypto::Token::validate(
            &value,
            &self.token_secret,
            &self.server_name,
        )
        .map_err(|err| {
            tracing::warn!(error = %err, "rejected session token");
            Error::Unauthorized
        })?;

        let user_id = u32::from_str(&tok.sub).map_err(|_| Error::Unauthorized)?;

        let user = self.db.get_user(user_id).await?;

        if user.token_version != tok.version {
            tracing::warn!(user_id, "revoked session token");
            return Err(Error::Unauthorized)
        }

        Ok(user)
    }

    async fn authenticate_api_key(
        &self,
        api_key : Option<String>,
    ) -> Result<models::User> {
        let api_key = api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(Error::MissingApiKey)?;

        self.db.get_user_by_api_key(api_key).await.map_err(|err| {
            if let Error::InvalidApiKey = err {
                tracing::warn!("rejected api key");
            }
            err
        })
    }
}

fn with_server(
    server : &Server,
) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    let server = Arc::clone(server);

    warp::any().map(move || Arc::clone(&server))
}

/// Dashboard authentication: session token from the cookie or a bearer
/// header.
fn with_session(
    server : &Server,
) -> impl Filter<Extract = (models::User,), Error = Rejection> + Clone {
    with_server(server)
        .and(filters::cookie::optional::<String>(COOKIE_NAME))
        .and(filters::header::optional::<String>("authorization"))
        .and_then(
            |server : Server,
             cookie : Option<String>,
             authorization : Option<String>| async move {
                server
                    .authenticate_session(cookie, authorization)
                    .await
                    .map_err(Rejection::from)
            },
        )
}

/// Extension authentication: long lived API key header.
fn with_api_key(
    server : &Server,
) -> impl Filter<Extract = (models::User,), Error = Rejection> + Clone {
    with_server(server)
        .and(filters::header::optional::<String>(API_KEY_HEADER))
        .and_then(|server : Server, api_key : Option<String>| async move {
            server
                .authenticate_api_key(api_key)
                .await
                .map_err(Rejection::from)
        })
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T : serde::de::DeserializeOwned + Send,
{
    filters::body::content_length_limit(MAX_BODY).and(filters::body::json())
}

type BoxReply = Box<dyn Reply>;
type DynReply = std::result::Result<BoxReply, Infallible>;

/// Errors from a handler are replies too.
fn respond<R : Reply + 'static>(res : Result<R>) -> DynReply {
    Ok(match res {
        Ok(r) => Box::new(r),
        Err(err) => Box::new(err),
    })
}

#[derive(Serialize)]
struct Message {
    message : &'static str,
}

macro_rules! handler {
    ($name:ident ( $($aname:ident : $atype:ty),*) $body:block) => {
        pub fn $name (
            $(
                $aname : $atype,
            )*
        ) -> impl Filter<Extract = (BoxReply,) , Error = Rejection> + Clone {
            $body
        }
    }
}

macro_rules! handler_or{
    ($head:expr $(, $tail:expr)*) => {
        $head
        $(
            .or($tail)
            .unify()
            .boxed()
        )*
    };
    ($head:expr $(, $tail:expr)*,) => {
        handler_or!($head $(, $tail)*)
    }
}

pub fn routes(
    server : &Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    handler_or!(
        post_sync(server),
        get_sync(server),
        get_links(server),
        post_links(server),
        patch_link(server),
        delete_link(server),
        get_api_key(server),
        post_api_key(server),
        get_session(server),
        post_session(server),
        delete_session(server)
    )
    .recover(|err : Rejection| async move {
        Ok::<_, Rejection>(rejection_to_error(err))
    })
    .with(warp::log::custom(|info| {
        tracing::info!(
            status = info.status().as_u16(),
            method = %info.method(),
            path = info.path(),
            elapsed = ?info.elapsed(),
            "request"
        );
    }))
}

fn rejection_to_error(err : Rejection) -> Error {
    if let Some(err) = err.find::<Error>() {
        return clone_error(err)
    }

    if err.is_not_found() {
        Error::RouteNotFound
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        Error::BadRequest(e.to_string())
    } else if err.find::<InvalidQuery>().is_some() {
        Error::BadRequest("invalid query string".into())
    } else if err.find::<LengthRequired>().is_some() {
        Error::BadRequest("content-length required".into())
    } else if err.find::<UnsupportedMediaType>().is_some() {
        Error::BadRequest("expected a JSON body".into())
    } else if err.find::<PayloadTooLarge>().is_some() {
        Error::PayloadTooLarge
    } else if err.find::<MethodNotAllowed>().is_some() {
        Error::MethodNotAllowed
    } else {
        tracing::error!(rejection = ?err, "unhandled rejection");
        Error::Internal
    }
}

// only the authentication filters reject with an Error
fn clone_error(err : &Error) -> Error {
    match err {
        Error::MissingApiKey => Error::MissingApiKey,
        Error::InvalidApiKey => Error::InvalidApiKey,
        Error::UserIdNotFound(id) => Error::UserIdNotFound(*id),
        Error::Unauthorized => Error::Unauthorized,
        other => {
            tracing::error!(error = %other, "request failed");
            Error::Internal
        },
    }
}

handler! { post_sync (server : &Server) {
    #[derive(Deserialize)]
    struct Req {
        #[serde(default)]
        links : serde_json::Value,
    }

    warp::path!("api" / "sync")
        .and(method::post())
        .and(with_api_key(server))
        .and(with_server(server))
        .and(json_body())
        .and_then(|user : models::User, server : Server, body : Req| async move {
            respond(push_links(&server, &user, body.links).await)
        })
}}

async fn push_links(
    server : &Server,
    user : &models::User,
    links : serde_json::Value,
) -> Result<impl Reply> {
    let items = match links {
        serde_json::Value::Array(items) => items,
        _ => return Err(Error::BadRequest("Links must be an array".into())),
    };

    let report = sync::push_json(&server.db, user.id, items).await;

    Ok(reply::json(&report))
}

handler! { get_sync (server : &Server) {
    #[derive(Deserialize)]
    struct Query {
        #[serde(rename = "lastSync")]
        last_sync : Option<String>,
    }

    #[derive(Serialize)]
    struct Res {
        links : Vec<models::Link>,
    }

    warp::path!("api" / "sync")
        .and(method::get())
        .and(with_api_key(server))
        .and(with_server(server))
        .and(warp::query::<Query>())
        .and_then(|user : models::User, server : Server, query : Query| async move {
            let since = match query.last_sync.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(s) => match models::Time::parse(s) {
                    Ok(t) => Some(t),
                    Err(_) => {
                        return respond::<reply::Json>(Err(Error::BadRequest(
                            format!("invalid lastSync: {}", s),
                        )))
                    },
                },
            };

            respond(
                sync::pull(&server.db, user.id, since)
                    .await
                    .map(|links| reply::json(&Res { links })),
            )
        })
}}

handler! { get_links (server : &Server) {
    #[derive(Serialize)]
    struct Res {
        links :      Vec<models::Link>,
        pagination : models::Pagination,
    }

    warp::path!("api" / "links")
        .and(method::get())
        .and(with_session(server))
        .and(with_server(server))
        .and(warp::query::<models::LinkQuery>())
        .and_then(|
            user : models::User,
            server : Server,
            query : models::LinkQuery
        | async move {
            let res = server
                .db
                .list_links(user.id, &query)
                .await
                .map(|(links, total)| reply::json(&Res {
                    links,
                    pagination : models::Pagination::new(&query, total),
                }));

            respond(res)
        })
}}

handler! { post_links (server : &Server) {
    warp::path!("api" / "links")
        .and(method::post())
        .and(with_session(server))
        .and(with_server(server))
        .and(json_body())
        .and_then(|
            user : models::User,
            server : Server,
            body : models::LinkInput
        | async move {
            respond(create_link(&server, &user, body).await.map(|link| {
                reply::with_status(reply::json(&link), StatusCode::CREATED)
            }))
        })
}}

async fn create_link(
    server : &Server,
    user : &models::User,
    body : models::LinkInput,
) -> Result<models::Link> {
    let raw = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingUrl)?;

    let url = sync::parse_link_url(raw)?;

    if server.db.find_link_by_url(user.id, url.as_str()).await?.is_some() {
        return Err(Error::DuplicateUrl(url.to_string()))
    }

    let link = server.db.insert_link(user.id, &body.into_new_link(url)).await?;

    tracing::info!(user_id = user.id, link_id = link.id, "link created");

    Ok(link)
}

handler! { patch_link (server : &Server) {
    warp::path!("api" / "links" / u32)
        .and(method::patch())
        .and(with_session(server))
        .and(with_server(server))
        .and(json_body())
        .and_then(|
            link_id : u32,
            user : models::User,
            server : Server,
            patch : models::LinkPatch
        | async move {
            let res = if patch.is_empty() {
                server.db.get_link(user.id, link_id).await
            } else {
                server.db.update_link(user.id, link_id, &patch).await
            };

            respond(res.map(|link| reply::json(&link)))
        })
}}

handler! { delete_link (server : &Server) {
    warp::path!("api" / "links" / u32)
        .and(method::delete())
        .and(with_session(server))
        .and(with_server(server))
        .and_then(|link_id : u32, user : models::User, server : Server| async move {
            let res = server.db.delete_link(user.id, link_id).await;

            if res.is_ok() {
                tracing::info!(user_id = user.id, link_id, "link deleted");
            }

            respond(res.map(|()| reply::json(&Message {
                message : "Link deleted successfully",
            })))
        })
}}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyRes {
    api_key : Option<String>,
}

handler! { get_api_key (server : &Server) {
    warp::path!("api" / "user" / "apikey")
        .and(method::get())
        .and(with_session(server))
        .and_then(|user : models::User| async move {
            respond(Ok(reply::json(&ApiKeyRes { api_key : user.api_key })))
        })
}}

handler! { post_api_key (server : &Server) {
    warp::path!("api" / "user" / "apikey")
        .and(method::post())
        .and(with_session(server))
        .and(with_server(server))
        .and_then(|user : models::User, server : Server| async move {
            respond(rotate_api_key(&server, &user).await.map(|user| {
                reply::json(&ApiKeyRes { api_key : user.api_key })
            }))
        })
}}

async fn rotate_api_key(
    server : &Server,
    user : &models::User,
) -> Result<models::User> {
    let mut attempts = 0;

    loop {
        attempts += 1;

        match server.db.set_api_key(user.id, &crypto::generate_api_key()).await {
            Ok(user) => {
                tracing::info!(user_id = user.id, "api key rotated");
                return Ok(user)
            },
            Err(Error::DuplicateApiKey) if attempts < API_KEY_ATTEMPTS => {},
            Err(err) => return Err(err),
        }
    }
}

handler! { get_session (server : &Server) {
    warp::path!("api" / "session")
        .and(method::get())
        .and(with_session(server))
        .and_then(|user : models::User| async move {
            respond(Ok(reply::json(&user)))
        })
}}

handler! { post_session (server : &Server) {
    struct Res {
        token : String,
        ttl :   Duration,
        user :  models::User,
    }

    impl Reply for Res {
        fn into_response(self) -> Response {
            let max_age = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);

            let cookie = Cookie::build(COOKIE_NAME, self.token)
                .http_only(true)
                .same_site(SameSite::Strict)
                .path("/")
                .max_age(time::Duration::seconds(max_age))
                .finish()
                .to_string();

            reply::with_header(reply::json(&self.user), header::SET_COOKIE, cookie)
                .into_response()
        }
    }

    warp::path!("api" / "session")
        .and(method::post())
        .and(with_session(server))
        .and(with_server(server))
        .and_then(|user : models::User, server : Server| async move {
            respond(server.issue_session(&user).map(|token| Res {
                token,
                ttl : server.session_ttl,
                user,
            }))
        })
}}

handler! { delete_session (server : &Server) {
    warp::path!("api" / "session")
        .and(method::delete())
        .and(with_session(server))
        .and(with_server(server))
        .and_then(|user : models::User, server : Server| async move {
            let res = server.db.bump_token_version(user.id).await.map(|()| {
                tracing::info!(user_id = user.id, "sessions revoked");

                let cookie = Cookie::build(COOKIE_NAME, "")
                    .http_only(true)
                    .same_site(SameSite::Strict)
                    .path("/")
                    .max_age(time::Duration::ZERO)
                    .finish()
                    .to_string();

                reply::with_header(
                    reply::json(&Message { message : "Signed out" }),
                    header::SET_COOKIE,
                    cookie,
                )
            });

            respond(res)
        })
}}

impl Reject for Error {}

impl Reply for Error {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Body {
            error : String,
        }

        let status = self.status();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        reply::with_status(
            reply::json(&Body {
                error : self.public_message(),
            }),
            status,
        )
        .into_response()
    }
}
