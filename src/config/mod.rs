pub mod models;
pub mod store;

pub use self::models::*;
pub use self::store::{load, save};
