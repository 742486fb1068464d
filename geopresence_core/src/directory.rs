//! Paged user listing client.

use crate::config::{parse_endpoint, ConfigError, API_SCHEMES};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Errors from the listing endpoint.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("listing endpoint returned status {0}")]
    Status(u16),

    #[error("invalid base address: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Company {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
}

/// One entry of the user listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub gender: String,
    pub university: String,
    pub image: String,
    pub company: Company,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Deserialize)]
struct UsersPage {
    #[serde(default)]
    users: Vec<User>,
}

/// Client for `GET {base}/users/GetUsersList?take=&skip=`.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    http: reqwest::Client,
    base: Url,
}

impl UserDirectory {
    pub fn new(base: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    /// Builds a directory from a raw base address.
    pub fn from_base(raw: &str) -> Result<Self, DirectoryError> {
        Ok(Self::new(parse_endpoint("listing base address", raw, API_SCHEMES)?))
    }

    /// Address of one page.
    pub fn page_url(&self, take: u32, skip: u32) -> Result<Url, DirectoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["users", "GetUsersList"]);
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("take", &take.to_string())
            .append_pair("skip", &skip.to_string());
        Ok(url)
    }

    /// Fetches one page of users.
    pub async fn fetch_page(&self, take: u32, skip: u32) -> Result<Vec<User>, DirectoryError> {
        let url = self.page_url(take, skip)?;
        debug!(%url, "fetching users");

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }

        let page: UsersPage = response.json().await?;
        Ok(page.users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_url() {
        let directory = UserDirectory::from_base("https://api.example.com").unwrap();
        assert_eq!(
            directory.page_url(10, 20).unwrap().as_str(),
            "https://api.example.com/users/GetUsersList?take=10&skip=20"
        );

        let nested = UserDirectory::from_base("http://localhost:5001/api/").unwrap();
        assert_eq!(
            nested.page_url(5, 0).unwrap().as_str(),
            "http://localhost:5001/api/users/GetUsersList?take=5&skip=0"
        );
    }

    #[test]
    fn test_from_base_rejects_bad_addresses() {
        assert!(matches!(
            UserDirectory::from_base(""),
            Err(DirectoryError::Config(ConfigError::Missing(_)))
        ));
        assert!(matches!(
            UserDirectory::from_base("wss://api.example.com"),
            Err(DirectoryError::Config(ConfigError::UnsupportedScheme { .. }))
        ));
    }

    #[test]
    fn test_users_page_decodes_camel_case() {
        let body = r#"{
            "users": [{
                "id": 1,
                "firstName": "Emily",
                "lastName": "Johnson",
                "username": "emilys",
                "email": "emily.johnson@x.dummyjson.com",
                "phone": "+81 965-431-3024",
                "gender": "female",
                "university": "University of Wisconsin--Madison",
                "image": "https://dummyjson.com/icon/emilys/128",
                "company": { "name": "Dooley, Kozey and Cronin", "title": "Sales Manager" }
            }],
            "total": 208
        }"#;

        let page: UsersPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.users.len(), 1);
        assert_eq!(page.users[0].full_name(), "Emily Johnson");
        assert_eq!(page.users[0].company.title, "Sales Manager");

        let empty: UsersPage = serde_json::from_str("{}").unwrap();
        assert!(empty.users.is_empty());
    }
}
