//! Lua execution hooks enforcing timeouts and termination requests
//!
//! The embedded VM is non-preemptive, so the engine polls for its two
//! asynchronous termination conditions from inside the VM itself:
//!
//! 1. A *periodic check hook* fires every 100 VM instructions. It reads the
//!    comm channel and the deadline out of the Lua registry and raises an
//!    aborting error when termination was requested or the deadline passed.
//! 2. An *abort hook* takes over once an abort has been raised. It re-installs
//!    itself on a per-line trigger before raising again, so a script that
//!    catches the error inside its own `pcall` hits it again on the very next
//!    line. This is the only mechanism that forcibly unwinds a user script
//!    across protected calls.
//!
//! Aborting errors carry the [`ABORT_MARKER`] prefix, which tells user-level
//! try/catch handling that the error must not be swallowed.

use chrono::{DateTime, Utc};
use mlua::{AnyUserData, HookTriggers, Lua};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::comm::CommChannel;
use crate::error::ABORT_MARKER;

/// Registry key for the step deadline, in milliseconds since the Unix epoch.
pub const STEP_TIMEOUT_MS_SINCE_EPOCH_KEY: &str = "TASKOMAT_STEP_TIMEOUT_MS_SINCE_EPOCH";

/// Registry key for the configured step timeout, in seconds.
pub const STEP_TIMEOUT_S_KEY: &str = "TASKOMAT_STEP_TIMEOUT_S";

/// Registry key for the comm channel handle (`Option<Arc<CommChannel>>`).
pub const COMM_CHANNEL_KEY: &str = "TASKOMAT_COMM_CHANNEL";

/// Registry key for the message raised by the abort hook.
pub const ABORT_ERROR_MESSAGE_KEY: &str = "TASKOMAT_ABORT_ERROR_MESSAGE";

/// Instructions executed between firings of the periodic check hook.
const HOOK_INSTRUCTION_INTERVAL: u32 = 100;

/// Milliseconds since the Unix epoch for `t0 + dt`, saturating to the maximum
/// representable time point on overflow.
pub(crate) fn ms_since_epoch(t0: DateTime<Utc>, dt: Duration) -> i64 {
    let t0_ms = t0.timestamp_millis();
    let dt_ms = i64::try_from(dt.as_millis()).unwrap_or(i64::MAX);
    t0_ms.saturating_add(dt_ms)
}

/// Write the deadline, the timeout in seconds, and the comm channel into the
/// Lua registry, then install the periodic check hook.
pub(crate) fn install_periodic_checks(
    lua: &Lua,
    t0: DateTime<Utc>,
    timeout: Duration,
    comm: Option<Arc<CommChannel>>,
) -> mlua::Result<()> {
    lua.set_named_registry_value(STEP_TIMEOUT_S_KEY, timeout.as_secs_f64())?;
    lua.set_named_registry_value(STEP_TIMEOUT_MS_SINCE_EPOCH_KEY, ms_since_epoch(t0, timeout))?;
    let channel = lua.create_any_userdata(comm)?;
    lua.set_named_registry_value(COMM_CHANNEL_KEY, channel)?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        |lua, _debug| check_timeout_and_termination(lua),
    );

    Ok(())
}

/// Raise an aborting error if termination was requested or the deadline has
/// passed. Shared by the periodic hook and the host `sleep()`.
pub(crate) fn check_timeout_and_termination(lua: &Lua) -> mlua::Result<()> {
    check_termination_request(lua)?;
    check_script_timeout(lua)?;
    Ok(())
}

fn check_termination_request(lua: &Lua) -> mlua::Result<()> {
    let channel: AnyUserData = lua
        .named_registry_value(COMM_CHANNEL_KEY)
        .map_err(|_| abort_error(lua, format!("{COMM_CHANNEL_KEY} not found in Lua registry")))?;

    let comm = channel.borrow::<Option<Arc<CommChannel>>>()?;
    if let Some(comm) = comm.as_ref() {
        if comm.is_termination_requested() {
            return Err(abort_error(lua, "Step aborted on user request"));
        }
    }

    Ok(())
}

fn check_script_timeout(lua: &Lua) -> mlua::Result<()> {
    let deadline_ms: i64 = lua
        .named_registry_value(STEP_TIMEOUT_MS_SINCE_EPOCH_KEY)
        .map_err(|_| {
            abort_error(
                lua,
                format!(
                    "Timeout time point not found in Lua registry ({STEP_TIMEOUT_MS_SINCE_EPOCH_KEY})"
                ),
            )
        })?;

    if Utc::now().timestamp_millis() > deadline_ms {
        let seconds: f64 = lua.named_registry_value(STEP_TIMEOUT_S_KEY).unwrap_or(-1.0);
        return Err(abort_error(
            lua,
            format!("Timeout: Script took more than {seconds} s to run"),
        ));
    }

    Ok(())
}

/// Store an [`ABORT_MARKER`]-prefixed message in the registry, arm the abort
/// hook, and return the error to raise.
fn abort_error(lua: &Lua, msg: impl Into<String>) -> mlua::Error {
    let text = format!("{ABORT_MARKER} {}", msg.into());
    let _ = lua.set_named_registry_value(ABORT_ERROR_MESSAGE_KEY, text.as_str());
    install_abort_hook(lua);
    mlua::Error::RuntimeError(text)
}

/// Install a line-triggered hook that raises the stored abort message.
///
/// The hook re-installs itself before raising. If any protected call inside
/// the script catches the error, the hook fires again on the next executed
/// line and the error re-propagates until it escapes the top-level call.
fn install_abort_hook(lua: &Lua) {
    lua.set_hook(HookTriggers::new().every_line(), |lua, _debug| {
        let msg: String = lua
            .named_registry_value(ABORT_ERROR_MESSAGE_KEY)
            .unwrap_or_else(|_| format!("{ABORT_MARKER} Script aborted"));
        install_abort_hook(lua);
        Err(mlua::Error::RuntimeError(msg))
    });
}
