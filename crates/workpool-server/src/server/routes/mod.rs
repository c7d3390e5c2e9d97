pub mod default;
pub mod pool;
pub mod tasks;
