pub mod context_size;
pub mod models;
pub mod settings;
