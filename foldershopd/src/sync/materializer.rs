use std::path::Path;

use foldershop_core::{
    Download, IdRef, META_OWNER_ID, META_PRODUCT_KEY, META_SOURCE_FILE, Media, MetaData,
    NewProduct, ProductPatch, ProductStatus, StorefrontClient, StorefrontError,
};
use thiserror::Error;

use super::naming::{self, FileClass};

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("cannot prepare category {folder}: {source}")]
    Category {
        folder: String,
        source: StorefrontError,
    },
    #[error("cannot read staged file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("media upload failed: {0}")]
    Media(StorefrontError),
    #[error("product save failed: {0}")]
    Save(StorefrontError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductDefaults {
    pub price: f64,
    pub status: ProductStatus,
}

impl Default for ProductDefaults {
    fn default() -> Self {
        Self {
            price: 9.99,
            status: ProductStatus::Draft,
        }
    }
}

impl ProductDefaults {
    pub fn price_string(&self) -> String {
        format!("{:.2}", self.price)
    }
}

/// Everything needed to turn one staged file into a product.
#[derive(Debug, Clone, Copy)]
pub struct FileRequest<'a> {
    pub product_key: &'a str,
    pub owner_id: u64,
    pub folder: &'a str,
    pub file_name: &'a str,
    /// Local copy to upload; may be a post-processed variant.
    pub staged: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedProduct {
    pub product_id: u64,
    pub class: FileClass,
}

pub struct Materializer {
    client: StorefrontClient,
    defaults: ProductDefaults,
}

impl Materializer {
    pub fn new(client: StorefrontClient, defaults: ProductDefaults) -> Self {
        Self { client, defaults }
    }

    /// Category, media upload, product, then author. A failed author
    /// assignment is logged but the product is kept.
    pub async fn create(&self, request: FileRequest<'_>) -> Result<CreatedProduct, MaterializeError> {
        let category = self
            .client
            .ensure_category(request.folder)
            .await
            .map_err(|source| MaterializeError::Category {
                folder: request.folder.to_string(),
                source,
            })?;

        let media = self.upload(request.file_name, request.staged).await?;
        let class = naming::classify(request.file_name);

        let mut product = NewProduct::simple(naming::product_title(request.file_name), request.product_key);
        product.status = self.defaults.status;
        product.regular_price = self.defaults.price_string();
        product.categories = vec![IdRef { id: category.id }];
        attach(&mut product, class, request.file_name, &media);
        product.meta_data = vec![
            MetaData::new(META_PRODUCT_KEY, request.product_key),
            MetaData::new(META_OWNER_ID, request.owner_id),
            MetaData::new(META_SOURCE_FILE, request.file_name),
        ];

        let created = self
            .client
            .create_product(&product)
            .await
            .map_err(MaterializeError::Save)?;

        if let Err(err) = self
            .client
            .set_product_author(created.id, request.owner_id)
            .await
        {
            tracing::warn!(
                "product {} created but author {} could not be set: {err}",
                created.id,
                request.owner_id
            );
        }

        Ok(CreatedProduct {
            product_id: created.id,
            class,
        })
    }

    /// Replaces the attachment of an existing product with a fresh upload.
    pub async fn refresh(
        &self,
        product_id: u64,
        request: FileRequest<'_>,
    ) -> Result<FileClass, MaterializeError> {
        let media = self.upload(request.file_name, request.staged).await?;
        let class = naming::classify(request.file_name);
        let patch = match class {
            FileClass::Image => ProductPatch {
                downloadable: Some(false),
                images: Some(vec![IdRef { id: media.id }]),
                ..ProductPatch::default()
            },
            FileClass::Downloadable => ProductPatch {
                downloadable: Some(true),
                downloads: Some(vec![Download::for_media(request.file_name, &media)]),
                ..ProductPatch::default()
            },
        };
        self.client
            .update_product(product_id, &patch)
            .await
            .map_err(MaterializeError::Save)?;
        Ok(class)
    }

    /// Uploads `staged` and stores its media id in the product meta `field`.
    pub async fn attach_preview(
        &self,
        product_id: u64,
        field: &str,
        file_name: &str,
        staged: &Path,
    ) -> Result<u64, MaterializeError> {
        let media = self.upload(file_name, staged).await?;
        let patch = ProductPatch {
            meta_data: vec![MetaData::new(field, media.id)],
            ..ProductPatch::default()
        };
        self.client
            .update_product(product_id, &patch)
            .await
            .map_err(MaterializeError::Save)?;
        Ok(media.id)
    }

    async fn upload(&self, file_name: &str, staged: &Path) -> Result<Media, MaterializeError> {
        let bytes = tokio::fs::read(staged)
            .await
            .map_err(|source| MaterializeError::Read {
                path: staged.display().to_string(),
                source,
            })?;
        self.client
            .upload_media(file_name, naming::mime_type_for(file_name), bytes)
            .await
            .map_err(MaterializeError::Media)
    }
}

fn attach(product: &mut NewProduct, class: FileClass, file_name: &str, media: &Media) {
    match class {
        FileClass::Image => {
            product.downloadable = false;
            product.images = vec![IdRef { id: media.id }];
        }
        FileClass::Downloadable => {
            product.downloadable = true;
            product.downloads = vec![Download::for_media(file_name, media)];
        }
    }
}
