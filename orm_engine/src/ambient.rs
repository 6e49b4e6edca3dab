//! Tracking kernel — ambient context.
//!
//! A per-thread LIFO stack per value type. `push` returns a guard that
//! restores the previous value when dropped; guards are `!Send`, so a
//! restore always happens on the pushing thread. Worker threads that
//! need the caller's context push it again for the duration of their
//! unit of work.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

thread_local! {
    static STACKS: RefCell<HashMap<TypeId, Vec<Box<dyn Any>>>> = RefCell::new(HashMap::new());
}

/// Restores the previous ambient value of `T` on drop.
#[must_use = "the ambient value is popped as soon as the guard is dropped"]
pub struct AmbientGuard<T: 'static> {
    depth: usize,
    _marker: PhantomData<(*const (), T)>,
}

impl<T: 'static> Drop for AmbientGuard<T> {
    fn drop(&mut self) {
        let depth = self.depth;
        // try_with: the thread-local may already be gone during thread teardown.
        let _ = STACKS.try_with(|stacks| {
            if let Some(stack) = stacks.borrow_mut().get_mut(&TypeId::of::<T>()) {
                stack.truncate(depth.saturating_sub(1));
            }
        });
    }
}

/// Make `value` the current ambient `T` on this thread.
pub fn push<T: Clone + 'static>(value: T) -> AmbientGuard<T> {
    let depth = STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        let stack = stacks.entry(TypeId::of::<T>()).or_default();
        stack.push(Box::new(value));
        stack.len()
    });
    AmbientGuard { depth, _marker: PhantomData }
}

/// Innermost ambient `T` on this thread.
pub fn current<T: Clone + 'static>() -> Option<T> {
    STACKS.with(|stacks| {
        stacks
            .borrow()
            .get(&TypeId::of::<T>())
            .and_then(|stack| stack.last())
            .and_then(|top| top.downcast_ref::<T>())
            .cloned()
    })
}

pub fn depth<T: 'static>() -> usize {
    STACKS.with(|stacks| stacks.borrow().get(&TypeId::of::<T>()).map_or(0, Vec::len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(&'static str);

    #[test]
    fn test_nested_push_restores_in_lifo_order() {
        assert_eq!(current::<Tag>(), None);
        let outer = push(Tag("outer"));
        {
            let _inner = push(Tag("inner"));
            assert_eq!(current::<Tag>(), Some(Tag("inner")));
            assert_eq!(depth::<Tag>(), 2);
        }
        assert_eq!(current::<Tag>(), Some(Tag("outer")));
        drop(outer);
        assert_eq!(current::<Tag>(), None);
    }

    #[test]
    fn test_threads_are_isolated() {
        let _g = push(Tag("main"));
        let seen = std::thread::spawn(current::<Tag>).join().unwrap();
        assert_eq!(seen, None);
        assert_eq!(current::<Tag>(), Some(Tag("main")));
    }

    #[test]
    fn test_types_do_not_share_stacks() {
        let _a = push(Tag("a"));
        let _b = push(7u32);
        assert_eq!(current::<u32>(), Some(7));
        assert_eq!(current::<Tag>(), Some(Tag("a")));
    }
}
