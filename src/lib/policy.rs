//! The tri-state failure policy (SPEC_FULL §4.9): Strict before the root is
//! unlocked, Permissive after, and Rescue whenever `-debug` is set and an
//! error occurs. Carries the process-wide mode flags as an explicit value
//! rather than ambient globals, so a compensator captures the policy that was
//! live when it was registered.

use std::cell::Cell;
use std::process::Command;

use crate::kernel;
use crate::paths;

const RESCUE_SHELL_BIN: &str = "/bin/sh";

#[derive(Debug)]
pub struct Policy {
    debug_mode: bool,
    poweroff_on_error: bool,
    ignore_errors: Cell<bool>,
}

impl Policy {
    pub fn new(debug_mode: bool, poweroff_on_error: bool) -> Policy {
        Policy {
            debug_mode,
            poweroff_on_error,
            ignore_errors: Cell::new(false),
        }
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn poweroff_on_error(&self) -> bool {
        self.poweroff_on_error
    }

    pub fn ignore_errors(&self) -> bool {
        self.ignore_errors.get()
    }

    /// Flip to the Permissive state. Called once the root device has been
    /// successfully unlocked - after that point, best-effort restoration is
    /// preferred over killing the machine.
    pub fn enter_permissive(&self) {
        self.ignore_errors.set(true);
    }

    /// Spawn an interactive rescue shell with `PS1` set, waiting for it to
    /// exit. Returns `true` when the shell exited with the "resume" sentinel.
    pub fn spawn_rescue_shell(&self) -> bool {
        info!("dropping to rescue shell");
        match Command::new(RESCUE_SHELL_BIN).env("PS1", "(rescue) # ").status() {
            Ok(status) => status.code() == Some(paths::RESCUE_SHELL_RESUME_CODE),
            Err(e) => {
                error!("failed to spawn rescue shell: {}", e);
                false
            }
        }
    }

    /// Consult the policy for a fallible step that just failed. Logs the
    /// error, then returns whether execution should continue (`true`) or the
    /// caller should treat this as a terminal failure (`false`).
    ///
    /// `Permissive` always continues; `Rescue` spawns a shell and continues
    /// only if it exits with the resume sentinel; otherwise the caller must
    /// still check `poweroff_on_error` itself for the hard-poweroff path,
    /// since that action never returns.
    pub fn assert<E: std::fmt::Display>(&self, err: E) -> bool {
        error!("{}", err);

        if self.ignore_errors() {
            return true;
        }

        if self.debug_mode {
            return self.spawn_rescue_shell();
        }

        false
    }

    /// Run `assert` against a `Result`, consuming and logging the error if present.
    pub fn assert_result<T, E: std::fmt::Display>(&self, result: std::result::Result<T, E>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => self.assert(e),
        }
    }

    /// Enter the unrecoverable path for a Strict-state failure: poweroff if
    /// configured to, otherwise the caller should exit non-zero.
    pub fn fail_hard(&self) -> ! {
        if self.poweroff_on_error {
            kernel::hard_poweroff()
        } else {
            std::process::exit(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expectest::prelude::*;

    #[test]
    fn test_permissive_always_continues() {
        let policy = Policy::new(false, false);
        policy.enter_permissive();
        expect!(policy.assert("boom")).to(be_true());
    }

    #[test]
    fn test_strict_without_debug_does_not_continue() {
        let policy = Policy::new(false, false);
        expect!(policy.assert("boom")).to(be_false());
    }

    #[test]
    fn test_ignore_errors_starts_false() {
        let policy = Policy::new(true, true);
        expect!(policy.ignore_errors()).to(be_false());
        policy.enter_permissive();
        expect!(policy.ignore_errors()).to(be_true());
    }
}
