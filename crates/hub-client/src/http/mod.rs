//! HTTP layer: raw auth endpoints and the authenticated gateway.

pub mod api;
mod gateway;

pub use api::{AuthApi, RenewedAccess, TokenPair};
pub use gateway::{ApiResponse, RequestGateway, RequestSpec};
