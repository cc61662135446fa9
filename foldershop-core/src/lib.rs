mod client;
mod users;

pub use client::{
    Category, Download, IdRef, META_OWNER_ID, META_PRODUCT_KEY, META_SOURCE_FILE,
    Media, MetaData, NewProduct, Product, ProductPatch, ProductStatus, StorefrontClient,
    StorefrontError,
};
pub use users::User;
