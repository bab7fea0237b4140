pub mod relay_http;
pub mod relay_ws;

pub use relay_http::RelayHttpClient;
pub use relay_ws::WsConnector;
