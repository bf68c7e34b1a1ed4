use axum::extract::Path;
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common_obs::{health_router, metrics_router, request_context, track_http_metrics};
use serde::Serialize;
use serde_json::json;

pub const SERVICE_NAME: &str = "catalog-svc";
pub const PORT_ENV: &str = "CATALOG_PORT";
pub const DEFAULT_PORT: u16 = 8081;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: u32,
    pub name: &'static str,
    pub price: &'static str,
    pub link: &'static str,
}

pub static PRODUCTS: [Product; 5] = [
    Product {
        id: 1,
        name: "Product 1",
        price: "$100",
        link: "/products/1",
    },
    Product {
        id: 2,
        name: "Product 2",
        price: "$150",
        link: "/products/2",
    },
    Product {
        id: 3,
        name: "Product 3",
        price: "$200",
        link: "/products/3",
    },
    Product {
        id: 4,
        name: "Product 4",
        price: "$250",
        link: "/products/4",
    },
    Product {
        id: 5,
        name: "Product 5",
        price: "$300",
        link: "/products/5",
    },
];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("product {0:?} not found")]
    NotFound(String),
}

impl IntoResponse for CatalogError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            CatalogError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        let body = json!({ "error": { "code": code, "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

pub fn build_router() -> Router {
    Router::new()
        .route("/products", get(list_products))
        .route("/products/", get(missing_product))
        .route("/products/:id", get(product_details))
        .merge(health_router(SERVICE_NAME))
        .merge(metrics_router())
        .layer(from_fn(track_http_metrics))
        .layer(from_fn(request_context))
}

async fn list_products() -> Json<&'static [Product]> {
    tracing::debug!(event = "products_listed", count = PRODUCTS.len());
    Json(&PRODUCTS[..])
}

/// Ids match on their decimal rendering, so `01` or `abc` are simply unknown.
async fn product_details(Path(raw_id): Path<String>) -> Result<Json<Product>, CatalogError> {
    let Some(product) = PRODUCTS
        .iter()
        .find(|product| product.id.to_string() == raw_id)
    else {
        tracing::debug!(event = "product_not_found", id = %raw_id);
        return Err(CatalogError::NotFound(raw_id));
    };

    tracing::debug!(event = "product_served", id = product.id);
    Ok(Json(product.clone()))
}

async fn missing_product() -> CatalogError {
    CatalogError::NotFound(String::new())
}
