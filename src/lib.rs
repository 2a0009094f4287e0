pub mod blob_store;
pub mod config;
pub mod guard;
pub mod pipeline;
pub mod upstream;
pub mod warehouse;
pub mod window;
