pub mod impression;
pub mod store;

pub use impression::{Impression, SaveImpressionOptions};
pub use store::ImpressionStore;
