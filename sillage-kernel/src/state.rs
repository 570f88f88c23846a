use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Shared<T> = Arc<Mutex<T>>;
pub type SharedRw<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub fn new_state_rw<T>(value: T) -> SharedRw<T> {
    Arc::new(RwLock::new(value))
}
