pub mod credential_store;
pub mod reservation_cache;
pub mod reservations_api;
