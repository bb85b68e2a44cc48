mod expiry;
mod key;
mod store;

pub use expiry::init_expiry_worker;
pub use key::IdempotencyKey;
pub use store::check_and_set;
pub use store::get_record;
pub use store::record_response;
pub use store::request_hash;
pub use store::IdempotencyRecord;
pub use store::NextAction;
