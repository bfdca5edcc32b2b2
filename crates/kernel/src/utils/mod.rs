pub mod bitmap;
pub mod fixed;
pub mod locks;
pub mod types;
