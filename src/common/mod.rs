pub mod mentions;
pub mod models;
