pub mod record;
pub mod states;
pub mod stats;
