//! Serializes units of work on one store handle.
//!
//! A handle is either `Idle` or `InUnit(owner)`. Other threads asking for a
//! unit while one is running block until the owner leaves; the owner asking
//! again (re-entering from inside its own unit) gets `StoreBusy` instead of a
//! deadlock.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
	Idle,
	InUnit(ThreadId),
}

#[derive(Debug)]
pub struct UnitGuard {
	state: Mutex<UnitState>,
	released: Condvar,
}

/// Proof that the current thread holds the handle. Dropping it returns the
/// handle to `Idle`, on success and on error alike.
#[derive(Debug)]
pub struct UnitToken<'a> {
	guard: &'a UnitGuard,
}

impl UnitGuard {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(UnitState::Idle),
			released: Condvar::new(),
		}
	}

	pub fn enter(&self) -> Result<UnitToken<'_>> {
		let me = thread::current().id();
		let mut state = self.lock_state();

		loop {
			match *state {
				UnitState::Idle => break,
				UnitState::InUnit(owner) if owner == me => return Err(MirrorError::StoreBusy),
				UnitState::InUnit(_) => {
					state = self
						.released
						.wait(state)
						.unwrap_or_else(|poisoned| poisoned.into_inner());
				}
			}
		}

		*state = UnitState::InUnit(me);
		Ok(UnitToken { guard: self })
	}

	pub fn is_busy(&self) -> bool {
		*self.lock_state() != UnitState::Idle
	}

	// A panic inside a unit poisons nothing we care about: the state is reset by
	// the token's Drop during unwinding.
	fn lock_state(&self) -> MutexGuard<'_, UnitState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

impl Default for UnitGuard {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for UnitToken<'_> {
	fn drop(&mut self) {
		*self.guard.lock_state() = UnitState::Idle;
		self.guard.released.notify_one();
	}
}
