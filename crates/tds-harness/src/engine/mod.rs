pub mod capture;
pub mod client;
pub mod credentials;
pub mod listener;
pub mod mock;
pub mod proxy;
pub mod request;
pub mod wire;
