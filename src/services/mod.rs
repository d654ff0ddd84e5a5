pub mod cancel;
pub mod descriptor;
pub mod loader;
pub mod model_manager;
pub mod placement;
