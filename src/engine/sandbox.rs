//! Construction of restricted Lua environments for step scripts
//!
//! Every step execution gets a fresh environment with only the safe standard
//! library subset `{base, math, string, table, utf8}` opened, the dangerous
//! globals unbound, and the host commands installed. The environment never
//! outlives a single [`Step::execute()`](crate::Step::execute) call.

use mlua::{Lua, LuaOptions, StdLib, Value};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::hooks;
use crate::error::TaskResult;

/// Globals unbound after the library subset is opened.
const REMOVED_GLOBALS: [&str; 7] = [
    "collectgarbage",
    "debug",
    "dofile",
    "load",
    "loadfile",
    "print",
    "require",
];

/// Longest slice the host `sleep()` blocks for before re-running the
/// timeout/termination checks.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Build a fresh Lua environment with the restricted standard library subset
/// and the host commands installed.
pub(crate) fn build_sandbox() -> TaskResult<Lua> {
    let lua = Lua::new_with(
        StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    remove_dangerous_globals(&lua)?;
    install_custom_commands(&lua)?;
    Ok(lua)
}

fn remove_dangerous_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(name, Value::Nil)?;
    }
    Ok(())
}

fn install_custom_commands(lua: &Lua) -> mlua::Result<()> {
    lua.globals().set("sleep", lua.create_function(sleep)?)?;
    Ok(())
}

/// Cooperative sleep exposed to scripts as `sleep(seconds)`.
///
/// Wakes at most every 10 ms and runs the same checks as the periodic hook,
/// so long sleeps stay interruptible by timeouts and termination requests.
fn sleep(lua: &Lua, seconds: f64) -> mlua::Result<()> {
    let start = Instant::now();
    while start.elapsed().as_secs_f64() < seconds {
        hooks::check_timeout_and_termination(lua)?;
        let remaining = seconds - start.elapsed().as_secs_f64();
        thread::sleep(Duration::from_secs_f64(
            remaining.clamp(0.0, SLEEP_SLICE.as_secs_f64()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_bool(lua: &Lua, script: &str) -> bool {
        lua.load(script).eval::<bool>().unwrap()
    }

    #[test]
    fn test_dangerous_globals_are_nil() {
        let lua = build_sandbox().unwrap();
        for name in REMOVED_GLOBALS {
            assert!(
                eval_bool(&lua, &format!("return {name} == nil")),
                "{name} should be nil"
            );
        }
    }

    #[test]
    fn test_safe_libraries_are_available() {
        let lua = build_sandbox().unwrap();
        assert!(eval_bool(&lua, "return math.sqrt(9) == 3"));
        assert!(eval_bool(&lua, "return string.upper('abc') == 'ABC'"));
        assert!(eval_bool(&lua, "return table.concat({'a', 'b'}) == 'ab'"));
        assert!(eval_bool(&lua, "return utf8.len('héllo') == 5"));
    }

    #[test]
    fn test_unsafe_libraries_are_absent() {
        let lua = build_sandbox().unwrap();
        assert!(eval_bool(&lua, "return os == nil"));
        assert!(eval_bool(&lua, "return io == nil"));
        assert!(eval_bool(&lua, "return package == nil"));
    }

    #[test]
    fn test_sleep_is_installed() {
        let lua = build_sandbox().unwrap();
        assert!(eval_bool(&lua, "return type(sleep) == 'function'"));
    }

    #[test]
    fn test_sleep_returns_after_duration() {
        let lua = build_sandbox().unwrap();
        crate::engine::hooks::install_periodic_checks(
            &lua,
            chrono::Utc::now(),
            Duration::from_secs(60),
            None,
        )
        .unwrap();

        let start = Instant::now();
        lua.load("sleep(0.02)").exec().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
