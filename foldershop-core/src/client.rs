use std::fmt;
use std::str::FromStr;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const PRODUCTS_PATH: &str = "wp-json/wc/v3/products";
const CATEGORIES_PATH: &str = "wp-json/wc/v3/products/categories";
const MEDIA_PATH: &str = "wp-json/wp/v2/media";
const PRODUCT_POSTS_PATH: &str = "wp-json/wp/v2/product";

/// Meta key holding the deterministic product key.
pub const META_PRODUCT_KEY: &str = "_foldershop_product_key";
/// Meta key holding the owning user id.
pub const META_OWNER_ID: &str = "_foldershop_owner_id";
/// Meta key holding the source file name.
pub const META_SOURCE_FILE: &str = "_foldershop_source_file";

#[derive(Debug, Error)]
pub enum StorefrontError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid product status: {0}")]
    InvalidStatus(String),
}

#[derive(Clone)]
pub struct StorefrontClient {
    pub(crate) http: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl fmt::Debug for StorefrontClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorefrontClient")
            .field("base_url", &self.base_url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl StorefrontClient {
    /// Builds a client for the site at `base_url`, authenticating with a
    /// WordPress application password.
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, StorefrontError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    /// Looks a product up by SKU across every status, including drafts.
    pub async fn find_product_by_sku(&self, sku: &str) -> Result<Option<Product>, StorefrontError> {
        let mut url = self.endpoint(PRODUCTS_PATH)?;
        url.query_pairs_mut()
            .append_pair("sku", sku)
            .append_pair("status", "any")
            .append_pair("per_page", "1");
        let response = self.authorized(self.http.get(url)).send().await?;
        let products: Vec<Product> = Self::handle_response(response).await?;
        Ok(products.into_iter().find(|product| product.sku == sku))
    }

    pub async fn get_product(&self, id: u64) -> Result<Option<Product>, StorefrontError> {
        let url = self.endpoint(&format!("{PRODUCTS_PATH}/{id}"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    pub async fn create_product(&self, product: &NewProduct) -> Result<Product, StorefrontError> {
        let url = self.endpoint(PRODUCTS_PATH)?;
        let response = self
            .authorized(self.http.post(url))
            .json(product)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_product(
        &self,
        id: u64,
        patch: &ProductPatch,
    ) -> Result<Product, StorefrontError> {
        let url = self.endpoint(&format!("{PRODUCTS_PATH}/{id}"))?;
        let response = self
            .authorized(self.http.put(url))
            .json(patch)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Deletes a product. With `force` the product bypasses the trash.
    pub async fn delete_product(&self, id: u64, force: bool) -> Result<(), StorefrontError> {
        let mut url = self.endpoint(&format!("{PRODUCTS_PATH}/{id}"))?;
        if force {
            url.query_pairs_mut().append_pair("force", "true");
        }
        let response = self.authorized(self.http.delete(url)).send().await?;
        let _: serde_json::Value = Self::handle_response(response).await?;
        Ok(())
    }

    /// Reassigns the post author of a product.
    pub async fn set_product_author(&self, id: u64, author: u64) -> Result<(), StorefrontError> {
        let url = self.endpoint(&format!("{PRODUCT_POSTS_PATH}/{id}"))?;
        let response = self
            .authorized(self.http.post(url))
            .json(&serde_json::json!({ "author": author }))
            .send()
            .await?;
        let _: serde_json::Value = Self::handle_response(response).await?;
        Ok(())
    }

    /// Returns the category named `name`. The API hands names back
    /// HTML-escaped, so `Tom & Jerry` is listed as `Tom &amp; Jerry`.
    pub async fn find_category(&self, name: &str) -> Result<Option<Category>, StorefrontError> {
        let mut url = self.endpoint(CATEGORIES_PATH)?;
        url.query_pairs_mut()
            .append_pair("search", name)
            .append_pair("per_page", "100");
        let response = self.authorized(self.http.get(url)).send().await?;
        let categories: Vec<Category> = Self::handle_response(response).await?;
        Ok(categories
            .into_iter()
            .find(|category| category.name == name || unescape_html(&category.name) == name))
    }

    pub async fn create_category(&self, name: &str) -> Result<Category, StorefrontError> {
        let url = self.endpoint(CATEGORIES_PATH)?;
        let response = self
            .authorized(self.http.post(url))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Finds or creates the category. A create refused with `term_exists`
    /// resolves to the id the API reports for the existing term.
    pub async fn ensure_category(&self, name: &str) -> Result<Category, StorefrontError> {
        if let Some(category) = self.find_category(name).await? {
            return Ok(category);
        }
        match self.create_category(name).await {
            Err(StorefrontError::Api { status, body }) => match existing_term_id(&body) {
                Some(id) => Ok(Category {
                    id,
                    name: name.to_string(),
                    slug: String::new(),
                }),
                None => Err(StorefrontError::Api { status, body }),
            },
            other => other,
        }
    }

    /// Uploads raw bytes into the media library.
    pub async fn upload_media(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Media, StorefrontError> {
        let url = self.endpoint(MEDIA_PATH)?;
        let disposition = format!(
            "attachment; filename=\"{}\"",
            file_name.replace('"', "")
        );
        let response = self
            .authorized(self.http.post(url))
            .header("Content-Disposition", disposition)
            .header("Content-Type", mime_type)
            .body(bytes)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub(crate) fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, StorefrontError> {
        Ok(self.base_url.join(path)?)
    }

    pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StorefrontError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(StorefrontError::Api { status, body })
        }
    }
}

/// Reverses the entity escaping WordPress applies to term names.
fn unescape_html(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[derive(Deserialize)]
struct TermExists {
    code: String,
    data: TermExistsData,
}

#[derive(Deserialize)]
struct TermExistsData {
    resource_id: u64,
}

fn existing_term_id(body: &str) -> Option<u64> {
    let error: TermExists = serde_json::from_str(body).ok()?;
    (error.code == "term_exists").then_some(error.data.resource_id)
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Draft,
    Pending,
    Publish,
    Private,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Draft => "draft",
            ProductStatus::Pending => "pending",
            ProductStatus::Publish => "publish",
            ProductStatus::Private => "private",
        }
    }
}

impl FromStr for ProductStatus {
    type Err = StorefrontError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(ProductStatus::Draft),
            "pending" => Ok(ProductStatus::Pending),
            "publish" | "published" => Ok(ProductStatus::Publish),
            "private" => Ok(ProductStatus::Private),
            other => Err(StorefrontError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetaData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub key: String,
    pub value: serde_json::Value,
}

impl MetaData {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            id: None,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Product {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub meta_data: Vec<MetaData>,
}

impl Product {
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.meta_data
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct IdRef {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Download {
    pub id: String,
    pub name: String,
    pub file: String,
}

impl Download {
    /// Builds a download entry whose id is the md5 of the file url.
    pub fn for_media(name: impl Into<String>, media: &Media) -> Self {
        Self {
            id: format!("{:x}", md5::compute(media.source_url.as_bytes())),
            name: name.into(),
            file: media.source_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewProduct {
    pub name: String,
    #[serde(rename = "type")]
    pub product_type: String,
    pub status: ProductStatus,
    pub catalog_visibility: String,
    pub regular_price: String,
    pub sku: String,
    pub categories: Vec<IdRef>,
    pub downloadable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<IdRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub downloads: Vec<Download>,
    pub meta_data: Vec<MetaData>,
}

impl NewProduct {
    pub fn simple(name: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product_type: "simple".to_string(),
            status: ProductStatus::Draft,
            catalog_visibility: "visible".to_string(),
            regular_price: String::new(),
            sku: sku.into(),
            categories: Vec::new(),
            downloadable: false,
            images: Vec::new(),
            downloads: Vec::new(),
            meta_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct ProductPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloadable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<IdRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<Vec<Download>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub meta_data: Vec<MetaData>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Category {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Media {
    pub id: u64,
    pub source_url: String,
    #[serde(default)]
    pub mime_type: String,
}
