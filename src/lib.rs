pub mod any;
pub mod bridge;
pub mod bytes;
pub mod context;
pub mod engine;
pub mod error;
