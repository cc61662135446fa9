use foldershop_core::{
    Download, IdRef, META_PRODUCT_KEY, MetaData, NewProduct, ProductPatch, ProductStatus,
    StorefrontClient, StorefrontError,
};
use serde_json::json;
use wiremock::matchers::{basic_auth, body_bytes, body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> StorefrontClient {
    StorefrontClient::new(&server.uri(), "admin", "app-pass").unwrap()
}

#[tokio::test]
async fn find_product_by_sku_searches_every_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wp-json/wc/v3/products"))
        .and(query_param("sku", "42-photo-jpg"))
        .and(query_param("status", "any"))
        .and(basic_auth("admin", "app-pass"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": 501,
                "name": "Photo",
                "sku": "42-photo-jpg",
                "status": "draft",
                "meta_data": [
                    { "id": 1, "key": "_foldershop_product_key", "value": "42-photo-jpg" }
                ]
            }
        ])))
        .mount(&server)
        .await;

    let product = client(&server)
        .find_product_by_sku("42-photo-jpg")
        .await
        .unwrap()
        .expect("product");

    assert_eq!(product.id, 501);
    assert_eq!(product.status, "draft");
    assert_eq!(
        product.meta(META_PRODUCT_KEY).and_then(|v| v.as_str()),
        Some("42-photo-jpg")
    );
}

#[tokio::test]
async fn find_product_by_sku_returns_none_for_empty_result() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wp-json/wc/v3/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let product = client(&server).find_product_by_sku("missing").await.unwrap();
    assert!(product.is_none());
}

#[tokio::test]
async fn create_product_posts_payload() {
    let server = MockServer::start().await;

    let mut product = NewProduct::simple("Manual", "42-manual-pdf");
    product.status = ProductStatus::Pending;
    product.regular_price = "9.99".into();
    product.categories = vec![IdRef { id: 3 }];
    product.downloadable = true;
    product.downloads = vec![Download {
        id: "abc".into(),
        name: "manual.pdf".into(),
        file: "https://shop.example/manual.pdf".into(),
    }];
    product.meta_data = vec![MetaData::new(META_PRODUCT_KEY, "42-manual-pdf")];

    Mock::given(method("POST"))
        .and(path("/wp-json/wc/v3/products"))
        .and(body_json(json!({
            "name": "Manual",
            "type": "simple",
            "status": "pending",
            "catalog_visibility": "visible",
            "regular_price": "9.99",
            "sku": "42-manual-pdf",
            "categories": [{ "id": 3 }],
            "downloadable": true,
            "downloads": [{
                "id": "abc",
                "name": "manual.pdf",
                "file": "https://shop.example/manual.pdf"
            }],
            "meta_data": [{ "key": "_foldershop_product_key", "value": "42-manual-pdf" }]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 77,
            "name": "Manual",
            "sku": "42-manual-pdf"
        })))
        .mount(&server)
        .await;

    let created = client(&server).create_product(&product).await.unwrap();
    assert_eq!(created.id, 77);
}

#[tokio::test]
async fn update_product_sends_only_set_fields() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/wp-json/wc/v3/products/77"))
        .and(body_json(json!({ "images": [{ "id": 9 }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 77 })))
        .mount(&server)
        .await;

    let patch = ProductPatch {
        images: Some(vec![IdRef { id: 9 }]),
        ..ProductPatch::default()
    };
    client(&server).update_product(77, &patch).await.unwrap();
}

#[tokio::test]
async fn delete_product_forces_hard_delete() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/wp-json/wc/v3/products/77"))
        .and(query_param("force", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 77 })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).delete_product(77, true).await.unwrap();
}

#[tokio::test]
async fn ensure_category_creates_missing_category() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .and(query_param("search", "alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 4, "name": "alice-archive", "slug": "alice-archive" }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .and(body_json(json!({ "name": "alice" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 5,
            "name": "alice",
            "slug": "alice"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let category = client(&server).ensure_category("alice").await.unwrap();
    assert_eq!(category.id, 5);
}

#[tokio::test]
async fn ensure_category_matches_html_escaped_names() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .and(query_param("search", "Tom & Jerry"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 9, "name": "Tom &amp; Jerry", "slug": "tom-jerry" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 10, "name": "x" })))
        .expect(0)
        .mount(&server)
        .await;

    let category = client(&server).ensure_category("Tom & Jerry").await.unwrap();
    assert_eq!(category.id, 9);
}

#[tokio::test]
async fn ensure_category_adopts_term_reported_as_existing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "term_exists",
            "message": "A term with the name provided already exists with this parent.",
            "data": { "status": 400, "resource_id": 11 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let category = client(&server).ensure_category("O'Neil").await.unwrap();
    assert_eq!(category.id, 11);
    assert_eq!(category.name, "O'Neil");
}

#[tokio::test]
async fn ensure_category_keeps_other_create_errors() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wc/v3/products/categories"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "code": "woocommerce_rest_cannot_create",
            "data": { "status": 403 }
        })))
        .mount(&server)
        .await;

    let err = client(&server).ensure_category("alice").await.unwrap_err();
    assert!(matches!(err, StorefrontError::Api { status, .. } if status.as_u16() == 403));
}

#[tokio::test]
async fn upload_media_sends_raw_body_with_disposition() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/media"))
        .and(header(
            "content-disposition",
            "attachment; filename=\"photo.JPG\"",
        ))
        .and(header("content-type", "image/jpeg"))
        .and(body_bytes(b"jpeg-bytes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 12,
            "source_url": "https://shop.example/uploads/photo.jpg",
            "mime_type": "image/jpeg"
        })))
        .mount(&server)
        .await;

    let media = client(&server)
        .upload_media("photo.JPG", "image/jpeg", b"jpeg-bytes".to_vec())
        .await
        .unwrap();
    assert_eq!(media.id, 12);
}

#[tokio::test]
async fn set_product_author_posts_to_wp_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/product/77"))
        .and(body_json(json!({ "author": 42 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 77, "author": 42 })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).set_product_author(77, 42).await.unwrap();
}

#[tokio::test]
async fn api_errors_carry_status_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/wp-json/wc/v3/products"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let err = client(&server)
        .create_product(&NewProduct::simple("A", "a"))
        .await
        .expect_err("expected api error");

    match &err {
        StorefrontError::Api { status, body } => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(body, "invalid credentials");
        }
        other => panic!("unexpected error: {other}"),
    }
}
