use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};
use rusqlite::{ffi, Connection};
use tokio::sync::Mutex;

use crate::{models, Error, Result};

const SCHEMA : &str = include_str!("schema.sql");

// SQLITE_CONSTRAINT_UNIQUE
const UNIQUE_VIOLATION : i64 = 2067;

fn error_code_match(
    err : &rusqlite::Error,
    code : ffi::ErrorCode,
    ext : i64,
) -> bool {
    matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == code
                && i64::from(e.extended_code) == ext)
}

fn is_unique_violation(err : &rusqlite::Error) -> bool {
    error_code_match(err, ffi::ErrorCode::ConstraintViolation, UNIQUE_VIOLATION)
}

macro_rules! db_method {
        ($name:ident (
            &$self:ident,
            $conn:ident,
            $($pname:ident : $ptype:ty),*
        ) -> $ret:ty $body:block ) => {
            pub async fn $name (&$self, $( $pname : $ptype, )* ) -> $ret {
                let $conn = $self.conn.lock().await;
                tokio::task::block_in_place(|| $body)
            }
        }
    }

/// Handle to the link store.
///
/// A single connection guarded by an async mutex; queries run on the
/// calling worker thread through `block_in_place`, so callers must be on a
/// multi-threaded runtime.
pub struct Db {
    conn : Mutex<Connection>,
}

impl Db {
    pub fn new<P : AsRef<std::path::Path>>(p : P) -> Result<Self> {
        Self::init(Connection::open(p)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn : Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn : Mutex::new(conn),
        })
    }

    db_method! {upsert_user(
        &self,
        conn,
        identity : &models::Identity
    ) -> Result<models::User> {
        let now = models::Time::now();

        conn
            .prepare_cached(
                "INSERT INTO users (email, name, image, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (email) DO UPDATE
                 SET name = excluded.name,
                     image = excluded.image,
                     updated_at = excluded.updated_at")?
            .execute(rusqlite::params![
                identity.email,
                identity.name,
                identity.image,
                now
            ])?;

        let mut stmt = conn
            .prepare_cached("SELECT * FROM users WHERE users.email = ?")?;

        let mut rows = stmt.query(rusqlite::params![identity.email])?;

        let row = rows.next()?.ok_or(Error::Internal)?;

        row_parse(row)
    }}

    db_method! {get_user(&self, conn, user_id : u32) -> Result<models::User> {
        let mut stmt = conn
            .prepare_cached("SELECT * FROM users WHERE users.id = ?")?;

        let mut rows = stmt.query(rusqlite::params![user_id])?;

        let row = rows.next()?
            .ok_or(Error::UserIdNotFound(user_id))?;

        row_parse(row)
    }}

    db_method! {get_user_by_api_key(
        &self,
        conn,
        api_key : &str
    ) -> Result<models::User> {
        let mut stmt = conn
            .prepare_cached("SELECT * FROM users WHERE users.api_key = ?")?;

        let mut rows = stmt.query(rusqlite::params![api_key])?;

        let row = rows.next()?.ok_or(Error::InvalidApiKey)?;

        row_parse(row)
    }}

    db_method! {set_api_key(
        &self,
        conn,
        user_id : u32,
        api_key : &str
    ) -> Result<models::User> {
        let changed = conn
            .prepare_cached(
                "UPDATE users SET api_key = ?, updated_at = ? WHERE id = ?")?
            .execute(rusqlite::params![api_key, models::Time::now(), user_id])
            .map_err(|err| {
                if is_unique_violation(&err) {
                    Error::DuplicateApiKey
                } else {
                    err.into()
                }
            })?;

        if changed == 0 {
            return Err(Error::UserIdNotFound(user_id));
        }

        let mut stmt = conn
            .prepare_cached("SELECT * FROM users WHERE users.id = ?")?;
        let mut rows = stmt.query(rusqlite::params![user_id])?;
        let row = rows.next()?.ok_or(Error::UserIdNotFound(user_id))?;

        row_parse(row)
    }}

    db_method! {bump_token_version(
        &self,
        conn,
        user_id : u32
    ) -> Result<()> {
        let changed = conn
            .prepare_cached(
                "UPDATE users
                 SET token_version = token_version + 1, updated_at = ?
                 WHERE id = ?")?
            .execute(rusqlite::params![models::Time::now(), user_id])?;

        if changed == 0 {
            return Err(Error::UserIdNotFound(user_id));
        }

        Ok(())
    }}

    db_method! {insert_link(
        &self,
        conn,
        user_id : u32,
        link : &models::NewLink
    ) -> Result<models::Link> {
        let now = models::Time::now();

        conn
            .prepare_cached(
                "INSERT INTO links (
                    user_id, url, title, description, domain, tags,
                    is_favorite, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)")?
            .execute(rusqlite::params![
                user_id,
                link.url.as_str(),
                link.title,
                link.description,
                link.domain(),
                link.tags,
                link.is_favorite,
                now
            ])
            .map_err(|err| {
                if is_unique_violation(&err) {
                    Error::DuplicateUrl(link.url.to_string())
                } else {
                    err.into()
                }
            })?;

        let id = conn.last_insert_rowid();

        let mut stmt = conn
            .prepare_cached("SELECT * FROM links WHERE links.id = ?")?;
        let mut rows = stmt.query(rusqlite::params![id])?;
        let row = rows.next()?.ok_or(Error::Internal)?;

        row_parse(row)
    }}

    db_method! {find_link_by_url(
        &self,
        conn,
        user_id : u32,
        url : &str
    ) -> Result<Option<models::Link>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM links
                 WHERE links.user_id = ? AND links.url = ?")?;

        let mut rows = stmt.query(rusqlite::params![user_id, url])?;

        match rows.next()? {
            Some(row) => Ok(Some(row_parse(row)?)),
            None => Ok(None),
        }
    }}

    db_method! {get_link(
        &self,
        conn,
        user_id : u32,
        link_id : u32
    ) -> Result<models::Link> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM links
                 WHERE links.id = ? AND links.user_id = ?")?;

        let mut rows = stmt.query(rusqlite::params![link_id, user_id])?;

        let row = rows.next()?.ok_or(Error::LinkNotFound(link_id))?;

        row_parse(row)
    }}

    db_method! {list_links(
        &self,
        conn,
        user_id : u32,
        query : &models::LinkQuery
    ) -> Result<(Vec<models::Link>, i64)> {
        const FILTER : &str = "
            WHERE links.user_id = ?1
              AND (?2 = ''
                   OR links.url LIKE ?3 ESCAPE '\\'
                   OR links.title LIKE ?3 ESCAPE '\\'
                   OR links.domain LIKE ?3 ESCAPE '\\')";

        let search = query.search.trim();
        let pattern = format!("%{}%", escape_like(search));

        let total : i64 = conn
            .prepare_cached(&format!("SELECT COUNT(*) FROM links {}", FILTER))?
            .query_row(rusqlite::params![user_id, search, pattern], |row| {
                row.get(0)
            })?;

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT * FROM links {}
             ORDER BY links.created_at DESC, links.id DESC
             LIMIT ?4 OFFSET ?5",
            FILTER
        ))?;

        let mut rows = stmt.query(rusqlite::params![
            user_id,
            search,
            pattern,
            query.limit(),
            query.offset()
        ])?;

        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            links.push(row_parse::<models::Link>(row)?);
        }

        Ok((links, total))
    }}

    db_method! {links_updated_since(
        &self,
        conn,
        user_id : u32,
        since : Option<models::Time>
    ) -> Result<Vec<models::Link>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM links
                 WHERE links.user_id = ?1
                   AND (?2 IS NULL OR links.updated_at >= ?2)
                 ORDER BY links.updated_at DESC, links.id DESC")?;

        let mut rows = stmt.query(rusqlite::params![user_id, since])?;

        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            links.push(row_parse::<models::Link>(row)?);
        }

        Ok(links)
    }}

    db_method! {update_link(
        &self,
        conn,
        user_id : u32,
        link_id : u32,
        patch : &models::LinkPatch
    ) -> Result<models::Link> {
        let changed = conn
            .prepare_cached(
                "UPDATE links SET
                    title = COALESCE(?3, title),
                    description = COALESCE(?4, description),
                    tags = COALESCE(?5, tags),
                    is_favorite = COALESCE(?6, is_favorite),
                    updated_at = ?7
                 WHERE id = ?1 AND user_id = ?2")?
            .execute(rusqlite::params![
                link_id,
                user_id,
                patch.title,
                patch.description,
                patch.tags,
                patch.is_favorite,
                models::Time::now()
            ])?;

        if changed == 0 {
            return Err(Error::LinkNotFound(link_id));
        }

        let mut stmt = conn
            .prepare_cached("SELECT * FROM links WHERE links.id = ?")?;
        let mut rows = stmt.query(rusqlite::params![link_id])?;
        let row = rows.next()?.ok_or(Error::LinkNotFound(link_id))?;

        row_parse(row)
    }}

    db_method! {delete_link(
        &self,
        conn,
        user_id : u32,
        link_id : u32
    ) -> Result<()> {
        let changed = conn
            .prepare_cached("DELETE FROM links WHERE id = ? AND user_id = ?")?
            .execute(rusqlite::params![link_id, user_id])?;

        if changed == 0 {
            return Err(Error::LinkNotFound(link_id));
        }

        Ok(())
    }}
}

fn escape_like(s : &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn row_parse<T : FromRow>(row : &rusqlite::Row<'_>) -> Result<T> {
    Ok(T::from_row(row)?)
}

trait FromRow: Sized {
    fn from_row(row : &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! impl_from_row {
        ($ty:ty { $($field:ident),* }) => {
            impl FromRow for $ty {
                fn from_row(row : &rusqlite::Row<'_>) -> rusqlite::Result<$ty> {
                    Ok(Self{
                    $(
                        $field : row.get(stringify!($field))?,
                    )*
                    })
                }
            }
        }
    }

impl_from_row! {models::User {
    id, email, name, image, api_key, token_version, created_at, updated_at
}}

impl_from_row! {models::Link {
    id, user_id, url, title, description, domain, tags, is_favorite,
    created_at, updated_at
}}

impl FromSql for models::Time {
    fn column_result(value : ValueRef) -> FromSqlResult<models::Time> {
        let s = value.as_str()?;

        models::Time::parse(s).map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

impl ToSql for models::Time {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.format().into())
    }
}

impl FromSql for models::Tags {
    fn column_result(value : ValueRef) -> FromSqlResult<models::Tags> {
        serde_json::from_str(value.as_str()?)
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

impl ToSql for models::Tags {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        serde_json::to_string(self)
            .map(ToSqlOutput::from)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
    }
}
