pub mod address;
pub mod config;
pub mod configmap;
pub mod node;
pub mod pod;
pub mod resource;
pub mod secret;
pub mod volume;
