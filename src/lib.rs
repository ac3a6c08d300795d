pub mod apdu;
pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod hybrid;
    pub mod session_keys;
}

pub mod models {
    pub mod audit;
    pub mod client;
    pub mod compliance;
    pub mod envelope;
    pub mod pairing;
    pub mod protocol;
    pub mod session;
}

pub mod repositories {
    pub mod memory_pairing;
    pub mod pairing_store;
    pub mod redis_pairing;
}

pub mod services {
    pub mod audit;
    pub mod compliance;
    pub mod error_handler;
    pub mod hub;
    pub mod notifier;
    pub mod pairing;
}

pub mod handlers {
    pub mod relay;
}

pub mod validation {
    pub mod pairing;
}
