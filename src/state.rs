use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::hamiltonian::Point;

struct StateStorage<P: Point> {
    free_states: RefCell<Vec<Rc<InnerStateReusable<P>>>>,
}

impl<P: Point> StateStorage<P> {
    fn new(capacity: usize) -> StateStorage<P> {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }
}

/// Hands out phase space points and takes them back once the last
/// reference is dropped, so that a transition does not allocate.
pub struct StatePool<P: Point> {
    storage: Rc<StateStorage<P>>,
    dim: usize,
}

impl<P: Point> StatePool<P> {
    pub fn new(dim: usize, capacity: usize) -> StatePool<P> {
        StatePool {
            storage: Rc::new(StateStorage::new(capacity)),
            dim,
        }
    }

    pub fn new_state(&self) -> State<P> {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => inner,
            None => Rc::new(InnerStateReusable {
                inner: P::new(self.dim),
                reuser: Rc::downgrade(&self.storage),
            }),
        };
        State {
            inner: std::mem::ManuallyDrop::new(inner),
        }
    }

    pub fn copy_state(&self, state: &State<P>) -> State<P> {
        let mut new_state = self.new_state();
        let point = new_state
            .try_point_mut()
            .expect("New state should not have references");
        state.point().copy_into(point);
        new_state
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[cfg(test)]
    fn num_free(&self) -> usize {
        self.storage.free_states.borrow().len()
    }
}

struct InnerStateReusable<P: Point> {
    inner: P,
    reuser: Weak<StateStorage<P>>,
}

/// A shared reference to a point in phase space.
///
/// Clones are cheap. The point can only be modified while
/// there are no other references to it.
pub struct State<P: Point> {
    inner: std::mem::ManuallyDrop<Rc<InnerStateReusable<P>>>,
}

impl<P: Point> Deref for State<P> {
    type Target = P;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}

#[derive(Debug)]
pub struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

impl<P: Point> State<P> {
    pub fn point(&self) -> &P {
        &self.inner.inner
    }

    pub fn try_point_mut(&mut self) -> Result<&mut P> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(&mut val.inner),
            None => Err(StateInUse {}),
        }
    }

    pub fn index_in_trajectory(&self) -> i64 {
        self.inner.inner.index_in_trajectory()
    }

    pub fn energy(&self) -> f64 {
        self.inner.inner.energy()
    }
}

impl<P: Point> Drop for State<P> {
    fn drop(&mut self) {
        let rc = unsafe { std::mem::ManuallyDrop::take(&mut self.inner) };
        if (Rc::strong_count(&rc) == 1) & (Rc::weak_count(&rc) == 0) {
            if let Some(storage) = rc.reuser.upgrade() {
                storage.free_states.borrow_mut().push(rc);
            }
        }
    }
}

impl<P: Point> Clone for State<P> {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}
