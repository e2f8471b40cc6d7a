//! One critical section per service
use std::sync::Mutex;

/// Owns a service's mutable state. Commands run one at a time inside
/// [`CriticalSection::enter`] and never release it mid-sequence, so commands
/// observe a total order equal to entry order.
///
/// A command that panics leaves the state as it was: its writes were staged
/// in a `Tx` that never reached the mirror. A poisoned lock is therefore
/// logged and taken back instead of failing every later command.
pub struct CriticalSection<T> {
    state: Mutex<T>,
}

impl<T> CriticalSection<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn enter<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("critical section poisoned by a panicking command; recovering");
                self.state.clear_poison();
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_entries_do_not_lose_updates() {
        let section = Arc::new(CriticalSection::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let section = section.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        section.enter(|n| {
                            let read = *n;
                            *n = read + 1;
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(section.enter(|n| *n), 8_000);
    }

    #[test]
    fn panicking_entry_does_not_wedge_the_section() {
        let section = Arc::new(CriticalSection::new(7u64));
        let inner = section.clone();
        let joined = thread::spawn(move || inner.enter(|_| -> u64 { panic!("boom") })).join();
        assert!(joined.is_err());

        assert_eq!(section.enter(|n| *n), 7);
        section.enter(|n| *n += 1);
        assert_eq!(section.enter(|n| *n), 8);
    }
}
