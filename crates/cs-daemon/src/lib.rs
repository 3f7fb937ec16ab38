pub mod api_error;
pub mod daemon;
pub mod http_api;
pub mod shutdown;
