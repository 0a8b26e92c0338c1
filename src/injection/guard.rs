//! Guarded call primitive.
//!
//! Every call that touches a possibly corrupted address or runs victim code on
//! corrupted data goes through [`guarded`]. Faults reported by checked access
//! arrive as `Err`, panics raised on the way are caught and converted, so a
//! corrupted value can only ever cost the current step.

use crate::instrumentation::Fault;
use log::warn;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

static INSTALL_HOOK: Once = Once::new();

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Install the process panic hook once. It stays silent while the current
/// thread is inside a guarded call and forwards to the previous hook otherwise.
fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(|depth| depth.get()) == 0 {
                previous(info);
            }
        }));
    });
}

/// Restores the default disposition when the guarded call ends, also on unwind
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `call`, converting a panic into [`Fault::Panicked`].
///
/// # Arguments
///
/// * `label` - Name of the operation, used for the log entry on failure.
/// * `call` - Operation to run.
///
/// # Returns
///
/// * `Ok(T)` - The operation completed.
/// * `Err(Fault)` - The operation reported a fault or panicked. The operation
///   is abandoned, it is never resumed.
pub fn guarded<T>(label: &str, call: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
    install_hook();
    let result = {
        let _depth = DepthGuard::enter();
        panic::catch_unwind(AssertUnwindSafe(call))
    };
    let result = match result {
        Ok(result) => result,
        Err(payload) => Err(Fault::Panicked(panic_message(payload.as_ref()))),
    };
    if let Err(fault) = &result {
        warn!("{label} failed: {fault}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_results_through() {
        assert_eq!(guarded("ok", || Ok::<_, Fault>(5)), Ok(5));
        assert_eq!(
            guarded::<()>("unmapped", || Err(Fault::Unmapped(0x10))),
            Err(Fault::Unmapped(0x10))
        );
    }

    #[test]
    fn contains_panics() {
        let result = guarded::<()>("panicking call", || panic!("invalid pointer 0x{:x}", 8));
        assert_eq!(result, Err(Fault::Panicked("invalid pointer 0x8".to_string())));
        // depth is back to zero after the unwind
        assert_eq!(GUARD_DEPTH.with(|depth| depth.get()), 0);

        let nested = guarded("outer", || guarded::<u8>("inner", || panic!("inner")));
        assert_eq!(nested, Err(Fault::Panicked("inner".to_string())));
        assert_eq!(GUARD_DEPTH.with(|depth| depth.get()), 0);
    }

    #[test]
    fn contains_out_of_bounds_access() {
        let words = vec![1u64, 2, 3];
        let index = words.len() + 5;
        let result = guarded("read", || Ok(words[index]));
        assert!(matches!(result, Err(Fault::Panicked(_))));
    }
}
