pub mod engine;
pub mod frame;
pub mod sharpen;
pub mod workspace;
