use std::sync::{Mutex, MutexGuard};

/// A value shared between the engine's tasks that is only ever read or modified as a whole,
///  inside a closure. The lock is held for the duration of the closure and never across an
///  `.await`, so closures must not block or call back into code that touches the same box.
///
/// A panic inside a closure does not poison the box: the next access sees whatever state the
///  closure left behind.
pub struct AtomicBox<T> {
    value: Mutex<T>,
}

impl <T> AtomicBox<T> {
    pub fn new(value: T) -> AtomicBox<T> {
        AtomicBox {
            value: Mutex::new(value),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn swap(&self, value: T) -> T {
        std::mem::replace(&mut self.lock(), value)
    }
}

impl <T: Clone> AtomicBox<T> {
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

impl <T: Default> Default for AtomicBox<T> {
    fn default() -> Self {
        AtomicBox::new(T::default())
    }
}
