use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use crate::time_utils::Time;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id :            u32,
    pub email :         String,
    pub name :          String,
    pub image :         String,
    #[serde(skip)]
    pub api_key :       Option<String>,
    #[serde(skip)]
    pub token_version : u32,
    pub created_at :    Time,
    pub updated_at :    Time,
}

/// What an identity provider tells us about a person.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    pub email : String,
    #[serde(default)]
    pub name :  String,
    #[serde(default)]
    pub image : String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id :          u32,
    pub user_id :     u32,
    pub url :         String,
    pub title :       String,
    pub description : String,
    pub domain :      String,
    pub tags :        Tags,
    pub is_favorite : bool,
    pub created_at :  Time,
    pub updated_at :  Time,
}

/// A set of tags. Entries are trimmed, blank ones dropped, and the set is
/// kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct Tags(BTreeSet<String>);

impl Tags {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, tag : &str) -> bool {
        self.0.contains(tag)
    }
}

impl<S : AsRef<str>> FromIterator<S> for Tags {
    fn from_iter<I : IntoIterator<Item = S>>(iter : I) -> Self {
        Tags(
            iter.into_iter()
                .map(|s| s.as_ref().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

impl From<Vec<String>> for Tags {
    fn from(v : Vec<String>) -> Self {
        v.into_iter().collect()
    }
}

/// A link about to be stored. The url is already validated and normalized.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub url :         url::Url,
    pub title :       String,
    pub description : String,
    pub tags :        Tags,
    pub is_favorite : bool,
}

impl NewLink {
    pub fn new(url : url::Url) -> Self {
        NewLink {
            url,
            title : String::new(),
            description : String::new(),
            tags : Tags::default(),
            is_favorite : false,
        }
    }

    pub fn domain(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Body of link creation and of a sync push item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInput {
    #[serde(default)]
    pub url :         Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title :       Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description : Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags :        Option<Tags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite : Option<bool>,
}

impl LinkInput {
    pub fn from_url<S : Into<String>>(url : S) -> Self {
        LinkInput {
            url : Some(url.into()),
            ..Default::default()
        }
    }

    pub fn into_new_link(self, url : url::Url) -> NewLink {
        NewLink {
            url,
            title : self.title.unwrap_or_default(),
            description : self.description.unwrap_or_default(),
            tags : self.tags.unwrap_or_default(),
            is_favorite : self.is_favorite.unwrap_or(false),
        }
    }
}

/// Partial update; `None` leaves the column alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPatch {
    pub title :       Option<String>,
    pub description : Option<String>,
    pub tags :        Option<Tags>,
    pub is_favorite : Option<bool>,
}

impl LinkPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.tags.is_none()
            && self.is_favorite.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkQuery {
    pub page :   i64,
    pub limit :  i64,
    pub search : String,
}

impl LinkQuery {
    pub const DEFAULT_LIMIT : i64 = 50;
    pub const MAX_LIMIT : i64 = 100;

    pub fn page(&self) -> i64 {
        self.page.max(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    /// Saturates, so a page far past the end is just empty.
    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.limit())
    }
}

impl Default for LinkQuery {
    fn default() -> Self {
        LinkQuery {
            page :   1,
            limit :  Self::DEFAULT_LIMIT,
            search : String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page :        i64,
    pub limit :       i64,
    pub total :       i64,
    pub total_pages : i64,
}

impl Pagination {
    pub fn new(query : &LinkQuery, total : i64) -> Self {
        let limit = query.limit();

        Pagination {
            page : query.page(),
            limit,
            total,
            total_pages : (total + limit - 1) / limit,
        }
    }
}
