pub mod distributor;

pub use distributor::MessageDistributor;
