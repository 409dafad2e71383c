// SPDX-License-Identifier: MPL-2.0

//! Small helpers around calloop registrations shared by the pipeline.

use std::time::Duration;

use calloop::{
    LoopHandle, RegistrationToken,
    timer::{TimeoutAction, Timer},
};

/// Unregister a source once the current dispatch has finished.
///
/// Sources are frequently torn down from inside callbacks (including their
/// own), so removal always happens from an idle callback.
pub(crate) fn remove_source_later<D: 'static>(
    handle: &LoopHandle<'static, D>,
    token: RegistrationToken,
) {
    let remover = handle.clone();
    handle.insert_idle(move |_| remover.remove(token));
}

/// Run `f` once after `delay`.
pub(crate) fn run_after<D: 'static>(
    handle: &LoopHandle<'static, D>,
    delay: Duration,
    f: impl FnOnce() + 'static,
) -> Option<RegistrationToken> {
    let mut f = Some(f);
    handle
        .insert_source(Timer::from_duration(delay), move |_, _, _| {
            if let Some(f) = f.take() {
                f();
            }
            TimeoutAction::Drop
        })
        .map_err(|err| tracing::error!(error = %err.error, "failed to arm timer"))
        .ok()
}

/// Call `tick` every `interval` until it returns `false`.
pub(crate) fn run_every<D: 'static>(
    handle: &LoopHandle<'static, D>,
    interval: Duration,
    mut tick: impl FnMut() -> bool + 'static,
) -> Option<RegistrationToken> {
    handle
        .insert_source(Timer::from_duration(interval), move |_, _, _| {
            if tick() {
                TimeoutAction::ToDuration(interval)
            } else {
                TimeoutAction::Drop
            }
        })
        .map_err(|err| tracing::error!(error = %err.error, "failed to arm refresh timer"))
        .ok()
}
