use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::client::{StorefrontClient, StorefrontError};

const USERS_PATH: &str = "wp-json/wp/v2/users";
const USERS_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct User {
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub name: String,
    /// WordPress serializes empty meta as `[]`, populated meta as an object.
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl User {
    /// True when one of the user's folder meta fields equals `folder`.
    ///
    /// Recognized keys are `sftp_folder`, `user_folder` and any key
    /// containing `folder`.
    pub fn has_folder_meta(&self, folder: &str) -> bool {
        let Some(meta) = self.meta.as_object() else {
            return false;
        };
        meta.iter().any(|(key, value)| {
            key.contains("folder") && meta_value_matches(value, folder)
        })
    }
}

fn meta_value_matches(value: &serde_json::Value, folder: &str) -> bool {
    match value {
        serde_json::Value::String(text) => text == folder,
        serde_json::Value::Array(items) => items.iter().any(|item| item.as_str() == Some(folder)),
        _ => false,
    }
}

impl StorefrontClient {
    /// Finds the user whose login equals `login` exactly.
    pub async fn find_user_by_login(&self, login: &str) -> Result<Option<User>, StorefrontError> {
        let mut url = self.endpoint(USERS_PATH)?;
        url.query_pairs_mut()
            .append_pair("search", login)
            .append_pair("context", "edit")
            .append_pair("per_page", &USERS_PAGE_SIZE.to_string());
        let response = self.authorized(self.http.get(url)).send().await?;
        let users: Vec<User> = Self::handle_response(response).await?;
        Ok(users.into_iter().find(|user| user.username == login))
    }

    pub async fn get_user(&self, id: u64) -> Result<Option<User>, StorefrontError> {
        let mut url = self.endpoint(&format!("{USERS_PATH}/{id}"))?;
        url.query_pairs_mut().append_pair("context", "edit");
        let response = self.authorized(self.http.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    pub async fn list_users_page(&self, page: u32) -> Result<Vec<User>, StorefrontError> {
        let mut url = self.endpoint(USERS_PATH)?;
        url.query_pairs_mut()
            .append_pair("context", "edit")
            .append_pair("page", &page.max(1).to_string())
            .append_pair("per_page", &USERS_PAGE_SIZE.to_string());
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Walks every user page looking for folder meta equal to `folder`.
    pub async fn find_user_by_folder_meta(
        &self,
        folder: &str,
    ) -> Result<Option<User>, StorefrontError> {
        let mut page = 1u32;
        loop {
            let users = self.list_users_page(page).await?;
            let exhausted = users.len() < USERS_PAGE_SIZE;
            if let Some(user) = users.into_iter().find(|user| user.has_folder_meta(folder)) {
                return Ok(Some(user));
            }
            if exhausted {
                return Ok(None);
            }
            page = page.saturating_add(1);
        }
    }
}
