//! The native-function catalogue registered by `Vm::new`, grounded on
//! `original_source/src/vm.c`'s `loadBuiltInNative`: the same small set
//! the original registers (`clock`, `sleep`, `system`, `random`, `gc`).

use std::rc::Rc;
use std::time::Duration;

use ember_core::object::{NativeContext, NativeFn};
use ember_core::value::Value;

fn arity_error(name: &str, expected: &str) -> String {
    format!("{name}: expected {expected}")
}

pub fn clock() -> NativeFn {
    Rc::new(|ctx, _args| Ok(Value::Number(ctx.elapsed_seconds())))
}

/// Blocks the single VM thread for `seconds`. Matches the original's
/// `sleepNative`: non-numeric or missing argument returns `-1` rather
/// than erroring.
pub fn sleep() -> NativeFn {
    Rc::new(|_ctx, args| match args.first().and_then(Value::as_number) {
        Some(seconds) if seconds >= 0.0 => {
            std::thread::sleep(Duration::from_secs_f64(seconds));
            Ok(Value::Number(0.0))
        }
        _ => Ok(Value::Number(-1.0)),
    })
}

/// Shells out via `std::process::Command`, returning the child's exit
/// code as a number (`-1` if it could not be spawned), matching the
/// original's use of C's `system()`.
pub fn system() -> NativeFn {
    Rc::new(|_ctx, args| {
        let Some(obj) = args.first().and_then(Value::as_obj) else {
            return Err(arity_error("system", "a string argument"));
        };
        let command = unsafe {
            match &obj.as_ref().kind {
                ember_core::object::ObjKind::String(s) => s.chars.to_string(),
                _ => return Err(arity_error("system", "a string argument")),
            }
        };
        let status = std::process::Command::new("sh").arg("-c").arg(&command).status();
        match status {
            Ok(status) => Ok(Value::Number(status.code().unwrap_or(-1) as f64)),
            Err(_) => Ok(Value::Number(-1.0)),
        }
    })
}

/// Returns `i32::MAX / draw` rather than a uniform `[0, 1)` value,
/// matching the original's `(double)RAND_MAX / (double)rand()` verbatim
/// (including its skewed distribution) for compatibility.
pub fn random() -> NativeFn {
    Rc::new(|_ctx, _args| {
        let draw: u32 = rand::random::<u32>() % i32::MAX as u32;
        if draw == 0 {
            Ok(Value::Number(0.0))
        } else {
            Ok(Value::Number(i32::MAX as f64 / draw as f64))
        }
    })
}

pub fn gc() -> NativeFn {
    Rc::new(|ctx, _args| {
        ctx.request_gc();
        Ok(Value::Nil)
    })
}
