//! Role-scoped dashboard responses behind a read-through cache.

pub mod cache;
pub mod claims;
pub mod routes;

pub use cache::{CachedResponse, MemoryCache, ResponseCache, build_cache_key, get_or_fetch};
pub use claims::{AuthError, Claims};
pub use routes::{AppError, AppState, DashboardQuery, routes};

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

pub async fn serve(addr: SocketAddr, state: AppState) -> common::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Dashboard API listening");
    axum::serve(listener, routes(state)).await?;
    Ok(())
}
