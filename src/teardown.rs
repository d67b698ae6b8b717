//! Teardown Coordinator — a LIFO stack of release actions seeded by every
//! subsystem at acquisition time, drained in reverse order on any exit path
//! (spec §4.7). Each action is expected to be idempotent or to tolerate a
//! "missing resource" error from the kernel tool, so running the sequence
//! twice is equivalent to running it once.

pub struct TeardownStack {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Drain and run every registered action in reverse (LIFO) order.
    /// Safe to call more than once: a drained stack simply does nothing.
    pub fn run(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Default for TeardownStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn runs_actions_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = TeardownStack::new();

        let o1 = order.clone();
        stack.push(move || o1.lock().unwrap().push(1));
        let o2 = order.clone();
        stack.push(move || o2.lock().unwrap().push(2));
        let o3 = order.clone();
        stack.push(move || o3.lock().unwrap().push(3));

        stack.run();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn running_twice_is_idempotent() {
        let count = Arc::new(Mutex::new(0));
        let mut stack = TeardownStack::new();
        let c = count.clone();
        stack.push(move || *c.lock().unwrap() += 1);

        stack.run();
        stack.run();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
