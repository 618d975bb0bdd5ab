pub mod iroh_transport;
pub mod relay;
