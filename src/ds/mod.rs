pub mod fold;
pub mod listeners;

pub use fold::{fold_left, Abandoned, Advance};
pub use listeners::{ListenerId, Listeners};
