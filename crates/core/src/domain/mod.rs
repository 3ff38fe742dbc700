pub mod classification;
pub mod intent;
pub mod memory;
pub mod routing;
