pub mod device_memory;
pub mod engine;
pub mod sim_engine;
