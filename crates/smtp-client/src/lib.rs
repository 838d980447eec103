pub mod address;
pub mod client;
pub mod client_types;
pub mod traits;

pub use address::*;
pub use client::*;
pub use client_types::*;
pub use traits::*;
