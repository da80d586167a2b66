pub mod auth;
pub mod stream;

pub use auth::TokenProvider;
