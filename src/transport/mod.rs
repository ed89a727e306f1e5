//! 端点传输实现

pub mod http;

pub use http::{DecodeFn, EncodeFn, HttpEndpoint, HttpFactory, decode_json, encode_json};
