pub mod atomic_box;
pub mod backoff;
pub mod bag;
pub mod buf;
pub mod random;
